//! Resource client: build, create, update, delete and read resource lists
//!
//! All cluster access goes through a [`ClusterApi`]. Create and Delete run the
//! objects of one kind concurrently and wait for the whole kind before moving
//! on, so manifests can order dependencies (a Namespace before what lives in
//! it). Update walks the target list in order.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};

use kube::api::{DeleteParams, DynamicObject, PropagationPolicy};
use kube::core::GroupVersionKind;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use kubesync_core::split_documents;

use crate::annotations::has_keep_policy;
use crate::cluster::{ClusterApi, PatchDocument};
use crate::error::{KubeError, Result};
use crate::field_manager::resolve_field_manager;
use crate::kinds::BuiltinKind;
use crate::options::{
    ClientConfig, CreateOptions, UpdateOptions, UpdateStrategy, WaitOptions, WaitStrategy,
};
use crate::patch::{PatchType, create_patch};
use crate::ready::{ReadyChecker, ReadyCheckerConfig};
use crate::resource::{ReconcileResult, ResourceInfo, ResourceList, gvk_from_type_meta};
use crate::retry::{KeyedLocks, retry_on_conflict};
use crate::wait::{HookOnlyWaiter, LegacyWaiter, StatusWaiter, Waiter};

/// Suffix of the [`ResourceClient::get`] key holding pods of listed workloads
pub const RELATED_SUFFIX: &str = "(related)";

/// Reconciles resource lists against a cluster
pub struct ResourceClient<C> {
    cluster: Arc<C>,
    config: Arc<ClientConfig>,
    field_manager: Arc<str>,
    locks: KeyedLocks,
}

impl<C> Clone for ResourceClient<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            config: Arc::clone(&self.config),
            field_manager: Arc::clone(&self.field_manager),
            locks: self.locks.clone(),
        }
    }
}

enum Applied {
    Created(DynamicObject),
    Updated(DynamicObject),
}

impl<C: ClusterApi> ResourceClient<C> {
    /// Create a client with the default configuration
    pub fn new(cluster: C) -> Self {
        Self::with_config(cluster, ClientConfig::default())
    }

    pub fn with_config(cluster: C, config: ClientConfig) -> Self {
        let field_manager = resolve_field_manager(config.field_manager.as_deref());
        Self {
            cluster: Arc::new(cluster),
            config: Arc::new(config),
            field_manager: field_manager.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Get the underlying cluster
    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Namespace given to namespaced objects that declare none
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Field manager attached to every write
    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    // ========== Build ==========

    /// Turn a multi-document manifest into resources
    ///
    /// Every document must name a type the cluster serves. With `validate`,
    /// built-in kinds are also checked against their schema.
    pub fn build<R: Read>(&self, mut reader: R, validate: bool) -> Result<ResourceList> {
        let mut manifest = String::new();
        reader.read_to_string(&mut manifest)?;

        let mut resources = ResourceList::new();
        for (index, document) in split_documents(&manifest).into_iter().enumerate() {
            let value: serde_json::Value = serde_yaml::from_str(document)?;
            if value.is_null() {
                continue;
            }
            let mut object: DynamicObject = serde_json::from_value(value)?;

            let types = object.types.as_ref().ok_or_else(|| {
                KubeError::InvalidManifest(format!(
                    "document {}: missing apiVersion or kind",
                    index + 1
                ))
            })?;
            let gvk = gvk_from_type_meta(types);
            let mapping = self.cluster.resolve(&gvk)?;

            if mapping.namespaced
                && object
                    .metadata
                    .namespace
                    .as_deref()
                    .is_none_or(str::is_empty)
            {
                object.metadata.namespace = Some(self.config.namespace.clone());
            }

            if validate {
                if let Some(kind) = BuiltinKind::from_gvk(&gvk) {
                    kind.validate(&serde_json::to_value(&object)?)?;
                }
            }

            resources.push(ResourceInfo::new(object, mapping)?);
        }

        debug!(count = resources.len(), "built resources");
        Ok(resources)
    }

    // ========== Create ==========

    /// Create every resource, refreshing each in place
    ///
    /// On failure the error carries the resources that were created.
    pub async fn create(
        &self,
        resources: &mut ResourceList,
        options: &CreateOptions,
    ) -> Result<ReconcileResult> {
        options.validate()?;
        if resources.is_empty() {
            return Err(KubeError::NoObjectsVisited);
        }
        let options = options.update_options();

        let mut created = Vec::new();
        let mut errors = Vec::new();

        for batch in resources.kind_batches() {
            let mut tasks = JoinSet::new();
            for index in batch {
                let client = self.clone();
                let info = resources.as_slice()[index].clone();
                let options = options.clone();
                tasks.spawn(async move {
                    let outcome = client.create_one(&info, &options).await;
                    (index, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, Ok(object))) => {
                        let info = &mut resources.as_mut_slice()[index];
                        info.refresh(object);
                        info!(kind = %info.kind(), name = %info.name, "created");
                        created.push(index);
                    }
                    Ok((_, Err(e))) => errors.push(e),
                    Err(e) => errors.push(e.into()),
                }
            }
        }

        created.sort_unstable();
        let result = ReconcileResult {
            created: created
                .into_iter()
                .map(|index| resources.as_slice()[index].clone())
                .collect(),
            ..Default::default()
        };
        finish(result, errors)
    }

    async fn create_one(&self, info: &ResourceInfo, options: &UpdateOptions) -> Result<DynamicObject> {
        let _guard = self.locks.lock(&info.key()).await;
        self.create_locked(info, options).await
    }

    /// Create path shared with Update; the caller holds the identity lock
    async fn create_locked(
        &self,
        info: &ResourceInfo,
        options: &UpdateOptions,
    ) -> Result<DynamicObject> {
        let operation = format!("create {}", info.display_name());
        retry_on_conflict(&self.config.conflict_backoff, &operation, move || async move {
            if options.server_side_apply {
                self.apply(info, options).await
            } else {
                self.cluster
                    .create(info, &options.post_params(&self.field_manager))
                    .await
            }
        })
        .await
    }

    /// Server-side apply of the full object
    async fn apply(&self, info: &ResourceInfo, options: &UpdateOptions) -> Result<DynamicObject> {
        let mut object = info.object.clone();
        object.metadata.managed_fields = None;
        object.metadata.resource_version = None;

        let params = options.patch_params(&self.field_manager);
        self.cluster
            .patch(info, &PatchDocument::Apply(object), &params)
            .await
            .map_err(|e| {
                if e.is_unsupported_media_type() {
                    KubeError::ServerSideApplyUnsupported {
                        resource: info.display_name(),
                        message: e.to_string(),
                    }
                } else if e.status_code() == Some(409) {
                    KubeError::ApplyConflict {
                        resource: info.display_name(),
                        message: e.to_string(),
                    }
                } else {
                    e
                }
            })
    }

    // ========== Update ==========

    /// Bring the cluster from `original` to `target`
    ///
    /// Targets missing from the cluster are created and reported under
    /// `created`. Resources of `original` absent from `target` are deleted
    /// unless the live object carries the keep resource policy.
    pub async fn update(
        &self,
        original: &ResourceList,
        target: &mut ResourceList,
        options: &UpdateOptions,
    ) -> Result<ReconcileResult> {
        options.validate()?;
        let strategy = options.strategy();

        let mut result = ReconcileResult::default();
        let mut errors = Vec::new();

        for info in target.iter_mut() {
            match self.update_one(original, info, options, strategy).await {
                Ok(Applied::Created(object)) => {
                    info.refresh(object);
                    info!(kind = %info.kind(), name = %info.name, "created");
                    result.created.push(info.clone());
                }
                Ok(Applied::Updated(object)) => {
                    info.refresh(object);
                    result.updated.push(info.clone());
                }
                Err(e) => {
                    warn!(resource = %info.display_name(), error = %e, "update failed");
                    errors.push(e);
                }
            }
        }

        for info in original.difference(target).iter() {
            match self.delete_obsolete(info, options.dry_run).await {
                Ok(true) => result.deleted.push(info.clone()),
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }

        finish(result, errors)
    }

    async fn update_one(
        &self,
        original: &ResourceList,
        info: &ResourceInfo,
        options: &UpdateOptions,
        strategy: UpdateStrategy,
    ) -> Result<Applied> {
        let _guard = self.locks.lock(&info.key()).await;

        let Some(live) = self.cluster.get(info).await? else {
            debug!(resource = %info.display_name(), "not found, creating");
            return self.create_locked(info, options).await.map(Applied::Created);
        };

        let baseline = original
            .get(&info.key())
            .ok_or_else(|| KubeError::MissingOriginal {
                resource: info.display_name(),
            })?;

        let updated = match strategy {
            UpdateStrategy::Replace => {
                let mut object = info.object.clone();
                object.metadata.resource_version = live.metadata.resource_version.clone();
                debug!(resource = %info.display_name(), "replacing");
                self.cluster
                    .replace(info, &object, &options.post_params(&self.field_manager))
                    .await?
            }
            UpdateStrategy::ServerSideApply { force } => {
                debug!(resource = %info.display_name(), force, "applying");
                self.apply(info, options).await?
            }
            UpdateStrategy::ClientSidePatch {
                three_way_unstructured,
            } => {
                let patch = create_patch(
                    &baseline_document(&baseline.object)?,
                    &serde_json::to_value(&live)?,
                    &serde_json::to_value(&info.object)?,
                    &info.gvk,
                    three_way_unstructured,
                )?;
                if patch.is_empty() {
                    debug!(resource = %info.display_name(), "no changes, skipping patch");
                    live
                } else {
                    debug!(
                        resource = %info.display_name(),
                        content_type = patch.patch_type.content_type(),
                        "patching"
                    );
                    let document = match patch.patch_type {
                        PatchType::StrategicMerge => PatchDocument::Strategic(patch.data),
                        PatchType::JsonMerge => PatchDocument::Merge(patch.data),
                    };
                    self.cluster
                        .patch(info, &document, &options.patch_params(&self.field_manager))
                        .await?
                }
            }
        };
        Ok(Applied::Updated(updated))
    }

    /// Delete a resource dropped from the target; false when it was skipped
    async fn delete_obsolete(&self, info: &ResourceInfo, dry_run: bool) -> Result<bool> {
        let Some(live) = self.cluster.get(info).await? else {
            debug!(resource = %info.display_name(), "already gone");
            return Ok(false);
        };
        if has_keep_policy(&live.metadata) {
            info!(
                kind = %info.kind(),
                name = %info.name,
                "skipping delete due to resource policy annotation"
            );
            return Ok(false);
        }

        let params = DeleteParams {
            dry_run,
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.cluster.delete(info, &params).await {
            Ok(()) => {
                info!(kind = %info.kind(), name = %info.name, "deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ========== Delete ==========

    /// Delete every resource, best effort
    ///
    /// Resources already gone count as deleted. Failures are returned next to
    /// the result instead of stopping the batch.
    pub async fn delete(
        &self,
        resources: &ResourceList,
        policy: PropagationPolicy,
    ) -> (ReconcileResult, Vec<KubeError>) {
        if resources.is_empty() {
            return (ReconcileResult::default(), vec![KubeError::NoObjectsVisited]);
        }

        let result = Arc::new(Mutex::new(ReconcileResult::default()));
        let mut errors = Vec::new();

        for batch in resources.kind_batches() {
            let mut tasks = JoinSet::new();
            for info in &resources.as_slice()[batch] {
                let client = self.clone();
                let info = info.clone();
                let policy = policy.clone();
                let result = Arc::clone(&result);
                tasks.spawn(async move {
                    client.delete_one(&info, policy).await?;
                    result
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .deleted
                        .push(info);
                    Ok::<(), KubeError>(())
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(e) => errors.push(e.into()),
                }
            }
        }

        let result = std::mem::take(&mut *result.lock().unwrap_or_else(PoisonError::into_inner));
        (result, errors)
    }

    async fn delete_one(&self, info: &ResourceInfo, policy: PropagationPolicy) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(policy),
            ..Default::default()
        };
        match self.cluster.delete(info, &params).await {
            Ok(()) => {
                info!(kind = %info.kind(), name = %info.name, "deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %info.display_name(), "ignoring delete of missing object");
                Ok(())
            }
            Err(e) => {
                warn!(resource = %info.display_name(), error = %e, "delete failed");
                Err(e)
            }
        }
    }

    // ========== Get ==========

    /// Live objects grouped by `version/Kind`
    ///
    /// Objects missing from the cluster are left out. With `related`, pods of
    /// listed workloads are added under `v1/Pod(related)`.
    pub async fn get(
        &self,
        resources: &ResourceList,
        related: bool,
    ) -> Result<BTreeMap<String, Vec<DynamicObject>>> {
        let mut objects: BTreeMap<String, Vec<DynamicObject>> = BTreeMap::new();

        for info in resources {
            let Some(live) = self.cluster.get(info).await? else {
                debug!(resource = %info.display_name(), "not found");
                continue;
            };

            if related {
                let pods = self.related_pods(info, &live).await?;
                if !pods.is_empty() {
                    objects
                        .entry(format!("v1/Pod{RELATED_SUFFIX}"))
                        .or_default()
                        .extend(pods);
                }
            }

            objects
                .entry(format!("{}/{}", info.gvk.version, info.kind()))
                .or_default()
                .push(live);
        }

        Ok(objects)
    }

    async fn related_pods(
        &self,
        info: &ResourceInfo,
        live: &DynamicObject,
    ) -> Result<Vec<DynamicObject>> {
        let Some(selector) = BuiltinKind::from_gvk(&info.gvk)
            .and_then(|kind| kind.pod_selector(&live.data))
        else {
            return Ok(Vec::new());
        };
        let mapping = self.cluster.resolve(&GroupVersionKind::gvk("", "v1", "Pod"))?;
        self.cluster
            .list(&mapping, info.namespace.as_deref(), &selector)
            .await
    }

    // ========== Wait ==========

    /// Build the waiter for a strategy
    pub fn waiter(&self, strategy: WaitStrategy, options: WaitOptions) -> Box<dyn Waiter> {
        match strategy {
            WaitStrategy::Legacy => Box::new(LegacyWaiter::new(Arc::clone(&self.cluster), options)),
            WaitStrategy::Watcher => Box::new(StatusWaiter::new(Arc::clone(&self.cluster))),
            WaitStrategy::HookOnly => Box::new(HookOnlyWaiter::new(StatusWaiter::new(
                Arc::clone(&self.cluster),
            ))),
        }
    }

    /// Readiness checker sharing this client's cluster
    pub fn ready_checker(&self, config: ReadyCheckerConfig) -> ReadyChecker<C> {
        ReadyChecker::new(Arc::clone(&self.cluster), config)
    }
}

/// Baseline for a client-side patch, without fields the server owns
fn baseline_document(object: &DynamicObject) -> Result<serde_json::Value> {
    let mut object = object.clone();
    let meta = &mut object.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.self_link = None;
    if let Some(data) = object.data.as_object_mut() {
        data.remove("status");
    }
    Ok(serde_json::to_value(&object)?)
}

fn finish(result: ReconcileResult, errors: Vec<KubeError>) -> Result<ReconcileResult> {
    if errors.is_empty() {
        debug!(summary = %result.summary(), "reconciled");
        Ok(result)
    } else {
        Err(KubeError::PartialFailure {
            result: Box::new(result),
            errors,
        })
    }
}
