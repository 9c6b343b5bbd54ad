use std::time::Duration;

use async_trait::async_trait;

use super::{StatusWaiter, Waiter, hook_kind};
use crate::annotations::is_hook;
use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::resource::ResourceList;

/// Waits for Pods and Jobs annotated as hooks; every other wait returns at once
pub struct HookOnlyWaiter<C> {
    inner: StatusWaiter<C>,
}

impl<C: ClusterApi> HookOnlyWaiter<C> {
    pub fn new(inner: StatusWaiter<C>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: ClusterApi> Waiter for HookOnlyWaiter<C> {
    async fn wait(&self, _resources: &ResourceList, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn wait_with_jobs(&self, _resources: &ResourceList, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        let hooks =
            resources.filter(|info| hook_kind(info).is_some() && is_hook(&info.object.metadata));
        self.inner.watch_until_ready(&hooks, timeout).await
    }

    async fn wait_for_delete(&self, _resources: &ResourceList, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cluster::MockCluster;
    use crate::error::KubeError;
    use crate::resource::{ResourceInfo, gvk_from_type_meta};
    use kube::api::DynamicObject;
    use serde_json::{Value, json};

    fn stored(cluster: &MockCluster, value: Value) -> ResourceInfo {
        let object: DynamicObject = serde_json::from_value(value).unwrap();
        let stored = cluster.insert(object).unwrap();
        let gvk = gvk_from_type_meta(stored.types.as_ref().unwrap());
        ResourceInfo::new(stored, cluster.resolve(&gvk).unwrap()).unwrap()
    }

    fn waiter(cluster: &MockCluster) -> HookOnlyWaiter<MockCluster> {
        HookOnlyWaiter::new(StatusWaiter::new(Arc::new(cluster.clone())))
    }

    fn pending_pod(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default" },
            "status": { "phase": "Pending" },
        })
    }

    fn hook_pod(name: &str) -> Value {
        let mut pod = pending_pod(name);
        pod["metadata"]["annotations"] = json!({ "helm.sh/hook": "test" });
        pod
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_waits_return_immediately() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pending_pod("api"))].into();
        let waiter = waiter(&cluster);

        let started = tokio::time::Instant::now();
        waiter.wait(&resources, Duration::from_secs(30)).await.unwrap();
        waiter
            .wait_with_jobs(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        waiter
            .wait_for_delete(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(cluster.operation_counts().gets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_pods_must_succeed() {
        let cluster = MockCluster::new();
        let config = stored(
            &cluster,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "cfg", "namespace": "default" },
            }),
        );
        let smoke = stored(&cluster, hook_pod("smoke-test"));
        let resources: ResourceList = vec![config, smoke].into();
        let waiter = waiter(&cluster);

        let err = waiter
            .watch_until_ready(&resources, Duration::from_secs(5))
            .await
            .unwrap_err();
        let KubeError::WaitTimeout { not_ready, .. } = err else {
            panic!("expected a timeout");
        };
        assert_eq!(not_ready, vec!["smoke-test: Pod not ready, status: InProgress"]);

        cluster
            .modify("Pod", Some("default"), "smoke-test", |p| {
                p.data["status"]["phase"] = json!("Succeeded");
            })
            .unwrap();
        waiter
            .watch_until_ready(&resources, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pods_without_hook_annotation_are_ignored() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![
            stored(&cluster, pending_pod("api")),
            stored(&cluster, hook_pod("migrate")),
        ]
        .into();
        cluster
            .modify("Pod", Some("default"), "migrate", |p| {
                p.data["status"]["phase"] = json!("Succeeded");
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        waiter(&cluster)
            .watch_until_ready(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
