//! Cluster access through a kube client and API discovery

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    runtime::{WatchStreamExt, watcher},
};
use tracing::{debug, trace};

use super::{ClusterApi, PatchDocument, WatchEvent};
use crate::error::{KubeError, Result};
use crate::resource::{ResourceInfo, RestMapping, api_version};

/// A real API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    discovery: Arc<Discovery>,
}

impl KubeCluster {
    /// Connect and run API discovery
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self::with_discovery(client, discovery))
    }

    /// Use a discovery snapshot that has already been run
    pub fn with_discovery(client: Client, discovery: Discovery) -> Self {
        Self {
            client,
            discovery: Arc::new(discovery),
        }
    }

    /// Rerun API discovery, e.g. after CRDs were installed
    pub async fn refresh_discovery(&mut self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        self.discovery = Arc::new(discovery);
        Ok(())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, mapping: &RestMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        match (mapping.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &mapping.resource),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &mapping.resource),
            (false, _) => Api::all_with(self.client.clone(), &mapping.resource),
        }
    }

    fn api_for(&self, info: &ResourceInfo) -> Api<DynamicObject> {
        self.api(&info.mapping, info.namespace.as_deref())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        let (resource, capabilities) =
            self.discovery
                .resolve_gvk(gvk)
                .ok_or_else(|| KubeError::UnknownResourceType {
                    api_version: api_version(gvk),
                    kind: gvk.kind.clone(),
                })?;

        Ok(RestMapping {
            resource,
            namespaced: capabilities.scope == Scope::Namespaced,
        })
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        trace!(resource = %info.display_name(), "GET");
        Ok(self.api_for(info).get_opt(&info.name).await?)
    }

    async fn create(&self, info: &ResourceInfo, params: &PostParams) -> Result<DynamicObject> {
        debug!(resource = %info.display_name(), dry_run = params.dry_run, "POST");
        Ok(self.api_for(info).create(params, &info.object).await?)
    }

    async fn patch(
        &self,
        info: &ResourceInfo,
        patch: &PatchDocument,
        params: &PatchParams,
    ) -> Result<DynamicObject> {
        let api = self.api_for(info);
        let patched = match patch {
            PatchDocument::Apply(object) => {
                debug!(resource = %info.display_name(), force = params.force, "PATCH (apply)");
                api.patch(&info.name, params, &Patch::Apply(object)).await?
            }
            PatchDocument::Merge(data) => {
                debug!(resource = %info.display_name(), "PATCH (merge)");
                api.patch(&info.name, params, &Patch::Merge(data)).await?
            }
            PatchDocument::Strategic(data) => {
                debug!(resource = %info.display_name(), "PATCH (strategic)");
                api.patch(&info.name, params, &Patch::Strategic(data)).await?
            }
        };
        Ok(patched)
    }

    async fn replace(
        &self,
        info: &ResourceInfo,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        debug!(resource = %info.display_name(), "PUT");
        Ok(self.api_for(info).replace(&info.name, params, object).await?)
    }

    async fn delete(&self, info: &ResourceInfo, params: &DeleteParams) -> Result<()> {
        debug!(resource = %info.display_name(), "DELETE");
        self.api_for(info).delete(&info.name, params).await?;
        Ok(())
    }

    async fn list(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(label_selector);
        let api = match (mapping.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &mapping.resource),
            _ => Api::all_with(self.client.clone(), &mapping.resource),
        };
        Ok(api.list(&params).await?.items)
    }

    fn watch(&self, info: &ResourceInfo) -> BoxStream<'static, WatchEvent> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", info.name));

        watcher(self.api_for(info), config)
            .default_backoff()
            .scan(None::<DynamicObject>, |initial, event| {
                let snapshot = match event {
                    Ok(watcher::Event::Init) => {
                        *initial = None;
                        None
                    }
                    Ok(watcher::Event::InitApply(object)) => {
                        *initial = Some(object);
                        None
                    }
                    Ok(watcher::Event::InitDone) => Some(Ok(initial.take())),
                    Ok(watcher::Event::Apply(object)) => Some(Ok(Some(object))),
                    Ok(watcher::Event::Delete(_)) => Some(Ok(None)),
                    Err(e) => Some(Err(KubeError::Watch(e.to_string()))),
                };
                futures::future::ready(Some(snapshot))
            })
            .filter_map(futures::future::ready)
            .boxed()
    }
}
