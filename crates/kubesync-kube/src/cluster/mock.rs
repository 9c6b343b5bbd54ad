//! In-memory cluster for testing
//!
//! Stores objects in memory with server-assigned resource versions,
//! generations and uids, serves watches from a broadcast channel, and can be
//! told to fail selected requests. Useful for unit tests without requiring a
//! Kubernetes cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::{
    apps::v1 as apps, batch::v1 as batch, core::v1 as core, networking::v1 as networking,
    rbac::v1 as rbac,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{DeleteParams, DynamicObject, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::ApiResource,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ClusterApi, PatchDocument, WatchEvent};
use crate::error::{KubeError, Result};
use crate::kinds::is_custom_group;
use crate::patch::{PatchType, apply_patch};
use crate::resource::{ObjectKey, ResourceInfo, RestMapping, api_version, gvk_from_type_meta};

const EVENT_CAPACITY: usize = 256;

/// Request kinds that can be counted and failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Patch,
    Replace,
    Delete,
    List,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub gets: usize,
    pub creates: usize,
    pub patches: usize,
    pub replaces: usize,
    pub deletes: usize,
    pub lists: usize,
}

impl OperationCounts {
    /// Requests that could have changed the cluster
    pub fn writes(&self) -> usize {
        self.creates + self.patches + self.replaces + self.deletes
    }
}

/// A scripted API failure
#[derive(Debug, Clone)]
pub struct Failure {
    verb: Verb,
    kind: Option<String>,
    name: Option<String>,
    code: u16,
    reason: String,
    message: String,
    remaining: Option<usize>,
}

impl Failure {
    /// Fail every request of `verb` with the given status
    pub fn new(verb: Verb, code: u16, reason: &str) -> Self {
        Self {
            verb,
            kind: None,
            name: None,
            code,
            reason: reason.to_string(),
            message: format!("injected {reason}"),
            remaining: None,
        }
    }

    /// Only fail requests for one object
    pub fn for_object(mut self, kind: &str, name: &str) -> Self {
        self.kind = Some(kind.to_string());
        self.name = Some(name.to_string());
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Stop failing after `n` requests
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, verb: Verb, key: &ObjectKey) -> bool {
        self.verb == verb
            && self.kind.as_ref().is_none_or(|k| *k == key.kind)
            && self.name.as_ref().is_none_or(|n| *n == key.name)
            && self.remaining != Some(0)
    }
}

/// A scripted slowdown of requests
#[derive(Debug, Clone)]
pub struct Delay {
    verb: Verb,
    kind: Option<String>,
    name: Option<String>,
    duration: Duration,
}

impl Delay {
    /// Hold every request of `verb` for `duration` before serving it
    pub fn new(verb: Verb, duration: Duration) -> Self {
        Self {
            verb,
            kind: None,
            name: None,
            duration,
        }
    }

    /// Only slow down requests for one object
    pub fn for_object(mut self, kind: &str, name: &str) -> Self {
        self.kind = Some(kind.to_string());
        self.name = Some(name.to_string());
        self
    }

    fn matches(&self, verb: Verb, key: &ObjectKey) -> bool {
        self.verb == verb
            && self.kind.as_ref().is_none_or(|k| *k == key.kind)
            && self.name.as_ref().is_none_or(|n| *n == key.name)
    }
}

struct State {
    mappings: Vec<RestMapping>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    failures: Vec<Failure>,
    delays: Vec<Delay>,
    counts: OperationCounts,
    journal: Vec<(Verb, ObjectKey)>,
    reject_apply: bool,
    finite_watches: bool,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn count(&mut self, verb: Verb) {
        let counter = match verb {
            Verb::Get => &mut self.counts.gets,
            Verb::Create => &mut self.counts.creates,
            Verb::Patch => &mut self.counts.patches,
            Verb::Replace => &mut self.counts.replaces,
            Verb::Delete => &mut self.counts.deletes,
            Verb::List => &mut self.counts.lists,
        };
        *counter += 1;
    }

    /// Count the request and return the scripted failure, if any
    fn check(&mut self, verb: Verb, key: &ObjectKey) -> Result<()> {
        self.count(verb);
        let Some(failure) = self.failures.iter_mut().find(|f| f.matches(verb, key)) else {
            return Ok(());
        };
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(KubeError::api(failure.code, &failure.reason, failure.message.clone()))
    }
}

/// In-memory cluster for testing
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<(ObjectKey, Option<DynamicObject>)>,
}

impl MockCluster {
    /// Create an empty cluster serving the common built-in types
    pub fn new() -> Self {
        let mappings = vec![
            RestMapping::namespaced(ApiResource::erase::<core::Pod>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::Service>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::ConfigMap>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::Secret>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::ServiceAccount>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::PersistentVolumeClaim>(&())),
            RestMapping::namespaced(ApiResource::erase::<core::ReplicationController>(&())),
            RestMapping::cluster(ApiResource::erase::<core::Namespace>(&())),
            RestMapping::cluster(ApiResource::erase::<core::PersistentVolume>(&())),
            RestMapping::namespaced(ApiResource::erase::<apps::Deployment>(&())),
            RestMapping::namespaced(ApiResource::erase::<apps::DaemonSet>(&())),
            RestMapping::namespaced(ApiResource::erase::<apps::StatefulSet>(&())),
            RestMapping::namespaced(ApiResource::erase::<apps::ReplicaSet>(&())),
            RestMapping::namespaced(ApiResource::erase::<batch::Job>(&())),
            RestMapping::namespaced(ApiResource::erase::<batch::CronJob>(&())),
            RestMapping::namespaced(ApiResource::erase::<networking::Ingress>(&())),
            RestMapping::namespaced(ApiResource::erase::<rbac::Role>(&())),
            RestMapping::namespaced(ApiResource::erase::<rbac::RoleBinding>(&())),
            RestMapping::cluster(ApiResource::erase::<rbac::ClusterRole>(&())),
            RestMapping::cluster(ApiResource::erase::<rbac::ClusterRoleBinding>(&())),
            RestMapping::cluster(ApiResource::erase::<CustomResourceDefinition>(&())),
        ];

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State {
                mappings,
                objects: BTreeMap::new(),
                next_version: 0,
                failures: Vec::new(),
                delays: Vec::new(),
                counts: OperationCounts::default(),
                journal: Vec::new(),
                reject_apply: false,
                finite_watches: false,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve an additional type, e.g. a custom resource
    pub fn register(&self, gvk: &GroupVersionKind, plural: &str, namespaced: bool) {
        self.lock().mappings.push(RestMapping {
            resource: ApiResource::from_gvk_with_plural(gvk, plural),
            namespaced,
        });
    }

    /// Script a failure
    pub fn inject_failure(&self, failure: Failure) {
        self.lock().failures.push(failure);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Script a slowdown
    pub fn inject_delay(&self, delay: Delay) {
        self.lock().delays.push(delay);
    }

    /// Completed writes, in the order they finished
    pub fn journal(&self) -> Vec<(Verb, ObjectKey)> {
        self.lock().journal.clone()
    }

    /// End new watches after their first snapshot, like a server closing streams
    pub fn end_watches_after_snapshot(&self) {
        self.lock().finite_watches = true;
    }

    /// Answer server-side apply requests with 415, like servers without apply support
    pub fn reject_server_side_apply(&self) {
        self.lock().reject_apply = true;
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.lock().counts.clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        self.lock().counts = OperationCounts::default();
    }

    /// Store an object as if another client had created it
    pub fn insert(&self, object: DynamicObject) -> Result<DynamicObject> {
        let key = self.key_of(&object)?;
        let stored = {
            let mut state = self.lock();
            let mut object = object;
            object.metadata.resource_version = Some(state.bump());
            object.metadata.uid.get_or_insert_with(|| format!("uid-{}", state.next_version));
            state.objects.insert(key.clone(), object.clone());
            object
        };
        self.publish(key, Some(stored.clone()));
        Ok(stored)
    }

    /// Mutate a stored object as a controller would, e.g. to update its status
    pub fn modify<F>(&self, kind: &str, namespace: Option<&str>, name: &str, f: F) -> Result<DynamicObject>
    where
        F: FnOnce(&mut DynamicObject),
    {
        let key = ObjectKey {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        let updated = {
            let mut state = self.lock();
            let version = state.bump();
            let object = state.objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
            f(object);
            object.metadata.resource_version = Some(version);
            object.clone()
        };
        self.publish(key, Some(updated.clone()));
        Ok(updated)
    }

    /// Remove an object as if another client had deleted it
    pub fn remove(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = ObjectKey {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        let removed = self.lock().objects.remove(&key);
        if removed.is_some() {
            self.publish(key, None);
        }
        removed
    }

    /// Current stored object
    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = ObjectKey {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        self.lock().objects.get(&key).cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_of(&self, object: &DynamicObject) -> Result<ObjectKey> {
        let types = object.types.as_ref().ok_or_else(|| {
            KubeError::InvalidManifest("object missing apiVersion or kind".to_string())
        })?;
        let mapping = self.resolve(&gvk_from_type_meta(types))?;
        Ok(ObjectKey {
            kind: types.kind.clone(),
            namespace: if mapping.namespaced {
                Some(
                    object
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| "default".to_string()),
                )
            } else {
                None
            },
            name: object.metadata.name.clone().unwrap_or_default(),
        })
    }

    fn publish(&self, key: ObjectKey, object: Option<DynamicObject>) {
        // no receivers is fine
        let _ = self.events.send((key, object));
    }

    /// Write a new revision of an object, bumping generation on spec changes
    fn store(
        &self,
        key: ObjectKey,
        mut object: DynamicObject,
        previous: Option<&DynamicObject>,
        dry_run: bool,
    ) -> DynamicObject {
        let stored = {
            let mut state = self.lock();
            let version = state.bump();

            let previous_generation = previous.and_then(|p| p.metadata.generation).unwrap_or(0);
            let spec_changed = previous.is_none_or(|p| p.data.get("spec") != object.data.get("spec"));
            object.metadata.generation = Some(if spec_changed {
                previous_generation + 1
            } else {
                previous_generation
            });
            object.metadata.resource_version = Some(version.clone());
            if object.metadata.uid.is_none() {
                object.metadata.uid = previous
                    .and_then(|p| p.metadata.uid.clone())
                    .or_else(|| Some(format!("uid-{version}")));
            }
            if key.namespace.is_some() {
                object.metadata.namespace = key.namespace.clone();
            }
            if !dry_run {
                state.objects.insert(key.clone(), object.clone());
            }
            object
        };
        if !dry_run {
            self.publish(key, Some(stored.clone()));
        }
        stored
    }

    fn existing(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    async fn pause(&self, verb: Verb, key: &ObjectKey) {
        let delay = self
            .lock()
            .delays
            .iter()
            .find(|d| d.matches(verb, key))
            .map(|d| d.duration);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, verb: Verb, key: ObjectKey) {
        self.lock().journal.push((verb, key));
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(key: &ObjectKey) -> KubeError {
    KubeError::api(404, "NotFound", format!("{} not found", key))
}

fn patched(
    object: &DynamicObject,
    patch: &Value,
    patch_type: PatchType,
) -> Result<DynamicObject> {
    let mut document = serde_json::to_value(object)?;
    apply_patch(&mut document, patch, patch_type);
    Ok(serde_json::from_value(document)?)
}

/// Equality-based label selector (`a=b,c=d`)
fn selector_matches(object: &DynamicObject, selector: &str) -> bool {
    let labels = object.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim_start_matches('='))
            }
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        self.lock()
            .mappings
            .iter()
            .find(|m| m.resource.group == gvk.group && m.resource.kind == gvk.kind)
            .map(|m| RestMapping {
                resource: ApiResource {
                    version: gvk.version.clone(),
                    api_version: api_version(gvk),
                    ..m.resource.clone()
                },
                namespaced: m.namespaced,
            })
            .ok_or_else(|| KubeError::UnknownResourceType {
                api_version: api_version(gvk),
                kind: gvk.kind.clone(),
            })
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        let key = info.key();
        self.pause(Verb::Get, &key).await;
        let mut state = self.lock();
        state.check(Verb::Get, &key)?;
        Ok(state.objects.get(&key).cloned())
    }

    async fn create(&self, info: &ResourceInfo, params: &PostParams) -> Result<DynamicObject> {
        let key = info.key();
        self.pause(Verb::Create, &key).await;
        {
            let mut state = self.lock();
            state.check(Verb::Create, &key)?;
            if state.objects.contains_key(&key) {
                return Err(KubeError::api(
                    409,
                    "AlreadyExists",
                    format!("{key} already exists"),
                ));
            }
        }
        let mut object = info.object.clone();
        object.metadata.resource_version = None;
        let stored = self.store(key.clone(), object, None, params.dry_run);
        self.record(Verb::Create, key);
        Ok(stored)
    }

    async fn patch(
        &self,
        info: &ResourceInfo,
        patch: &PatchDocument,
        params: &PatchParams,
    ) -> Result<DynamicObject> {
        let key = info.key();
        self.pause(Verb::Patch, &key).await;
        {
            let mut state = self.lock();
            state.check(Verb::Patch, &key)?;
            if matches!(patch, PatchDocument::Apply(_)) && state.reject_apply {
                return Err(KubeError::api(
                    415,
                    "UnsupportedMediaType",
                    "the body of the request was in an unknown format",
                ));
            }
        }

        let existing = self.existing(&key);
        let updated = match (patch, &existing) {
            (PatchDocument::Apply(object), None) => object.clone(),
            (PatchDocument::Apply(object), Some(live)) => {
                let patch_type = if is_custom_group(&info.gvk.group) {
                    PatchType::JsonMerge
                } else {
                    PatchType::StrategicMerge
                };
                patched(live, &serde_json::to_value(object)?, patch_type)?
            }
            (PatchDocument::Merge(data), Some(live)) => patched(live, data, PatchType::JsonMerge)?,
            (PatchDocument::Strategic(data), Some(live)) => {
                patched(live, data, PatchType::StrategicMerge)?
            }
            (_, None) => return Err(not_found(&key)),
        };

        let stored = self.store(key.clone(), updated, existing.as_ref(), params.dry_run);
        self.record(Verb::Patch, key);
        Ok(stored)
    }

    async fn replace(
        &self,
        info: &ResourceInfo,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        let key = info.key();
        self.pause(Verb::Replace, &key).await;
        self.lock().check(Verb::Replace, &key)?;

        let existing = self.existing(&key).ok_or_else(|| not_found(&key))?;
        let stale = object
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|version| existing.metadata.resource_version.as_ref() != Some(version));
        if stale {
            return Err(KubeError::api(
                409,
                "Conflict",
                format!("the object {key} has been modified; please apply your changes to the latest version"),
            ));
        }

        let mut replacement = object.clone();
        if let Some(status) = existing.data.get("status") {
            if let Some(map) = replacement.data.as_object_mut() {
                map.insert("status".to_string(), status.clone());
            }
        }
        let stored = self.store(key.clone(), replacement, Some(&existing), params.dry_run);
        self.record(Verb::Replace, key);
        Ok(stored)
    }

    async fn delete(&self, info: &ResourceInfo, params: &DeleteParams) -> Result<()> {
        let key = info.key();
        self.pause(Verb::Delete, &key).await;
        let removed = {
            let mut state = self.lock();
            state.check(Verb::Delete, &key)?;
            if !state.objects.contains_key(&key) {
                return Err(not_found(&key));
            }
            if params.dry_run {
                None
            } else {
                state.objects.remove(&key)
            }
        };
        if removed.is_some() {
            self.publish(key.clone(), None);
        }
        self.record(Verb::Delete, key);
        Ok(())
    }

    async fn list(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let probe = ObjectKey {
            kind: mapping.resource.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: String::new(),
        };
        let mut state = self.lock();
        state.check(Verb::List, &probe)?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == mapping.resource.kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, object)| selector_matches(object, label_selector))
            .map(|(_, object)| object.clone())
            .collect())
    }

    fn watch(&self, info: &ResourceInfo) -> BoxStream<'static, WatchEvent> {
        let key = info.key();
        // subscribe before reading the snapshot so no change is missed
        let receiver = self.events.subscribe();
        let snapshot = self.existing(&key);
        let first = stream::once(async move { Ok(snapshot) });
        if self.lock().finite_watches {
            return first.boxed();
        }

        let cluster = self.clone();
        let changes = stream::unfold((receiver, key), move |(mut receiver, key)| {
            let cluster = cluster.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((changed, object)) if changed == key => {
                            return Some((Ok(object), (receiver, key)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // skipped events may hold the latest state, start over from the store
                            debug!(%key, missed, "watch lagged, resending snapshot");
                            receiver = receiver.resubscribe();
                            let current = cluster.existing(&key);
                            return Some((Ok(current), (receiver, key)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        first.chain(changes).boxed()
    }
}
