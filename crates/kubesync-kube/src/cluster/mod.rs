//! Access to the cluster behind the resource client
//!
//! [`ClusterApi`] is the only way the client, the readiness checker and the
//! waiters talk to Kubernetes. [`KubeCluster`] drives a real API server
//! through `kube`; [`MockCluster`] keeps objects in memory for tests.

mod live;
mod mock;

pub use live::KubeCluster;
pub use mock::{Delay, Failure, MockCluster, OperationCounts, Verb};

use kube::api::{DeleteParams, DynamicObject, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::resource::{ResourceInfo, RestMapping};

/// Body of a PATCH request
#[derive(Debug, Clone)]
pub enum PatchDocument {
    /// Server-side apply of a full object
    Apply(DynamicObject),
    /// JSON merge patch
    Merge(Value),
    /// Strategic merge patch
    Strategic(Value),
}

/// Snapshot delivered by a watch: `None` once the object is gone
pub type WatchEvent = Result<Option<DynamicObject>>;

/// Operations the reconciler needs from a cluster
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Resolve the REST mapping of a type
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<RestMapping>;

    /// Read the live object, `None` when it does not exist
    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>>;

    /// Create `info.object`
    async fn create(&self, info: &ResourceInfo, params: &PostParams) -> Result<DynamicObject>;

    async fn patch(
        &self,
        info: &ResourceInfo,
        patch: &PatchDocument,
        params: &PatchParams,
    ) -> Result<DynamicObject>;

    /// Replace the live object with `object`
    async fn replace(
        &self,
        info: &ResourceInfo,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject>;

    async fn delete(&self, info: &ResourceInfo, params: &DeleteParams) -> Result<()>;

    /// List objects of a type matching a label selector
    async fn list(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Follow one object
    ///
    /// The first item reflects the current state (`None` if absent); later
    /// items follow every change. Dropping the stream stops the watch.
    fn watch(&self, info: &ResourceInfo) -> BoxStream<'static, WatchEvent>;
}
