//! Polling waiter built on the readiness checker

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use tracing::{debug, warn};

use super::{Waiter, hook_kind};
use crate::cluster::ClusterApi;
use crate::error::{KubeError, Result};
use crate::kinds::{BuiltinKind, decode};
use crate::options::WaitOptions;
use crate::ready::{DEFAULT_BACKOFF_LIMIT, ReadyChecker, ReadyCheckerConfig};
use crate::resource::{ObjectKey, ResourceInfo, ResourceList};

enum Probe<C> {
    Ready(ReadyChecker<C>),
    Deleted,
}

/// Polls every resource at [`WaitOptions::poll_interval`]
///
/// Transient API errors are retried up to [`WaitOptions::max_transient_errors`]
/// times per object; any other error ends the wait.
pub struct LegacyWaiter<C> {
    cluster: Arc<C>,
    options: WaitOptions,
}

impl<C: ClusterApi> LegacyWaiter<C> {
    pub fn new(cluster: Arc<C>, options: WaitOptions) -> Self {
        Self { cluster, options }
    }

    fn checker(&self, check_jobs: bool) -> ReadyChecker<C> {
        ReadyChecker::new(
            Arc::clone(&self.cluster),
            ReadyCheckerConfig {
                check_jobs,
                paused_as_ready: self.options.paused_as_ready,
            },
        )
    }

    async fn poll(&self, resources: &ResourceList, timeout: Duration, probe: Probe<C>) -> Result<()> {
        // everything is outstanding until a round completes
        let mut pending: Vec<String> = resources
            .iter()
            .map(|info| pending_line(info, &probe))
            .collect();
        let outcome =
            tokio::time::timeout(timeout, self.poll_until_done(resources, &probe, &mut pending))
                .await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(KubeError::WaitTimeout {
                not_ready: pending,
                timeout,
            }),
        }
    }

    /// `pending` holds the objects still outstanding after the latest complete round
    async fn poll_until_done(
        &self,
        resources: &ResourceList,
        probe: &Probe<C>,
        pending: &mut Vec<String>,
    ) -> Result<()> {
        let mut transient: HashMap<ObjectKey, u32> = HashMap::new();
        let mut round = 0u32;

        loop {
            round += 1;
            let mut outstanding = Vec::new();

            for info in resources {
                match self.check(probe, info).await {
                    Ok(done) => {
                        transient.remove(&info.key());
                        if !done {
                            outstanding.push(pending_line(info, probe));
                        }
                    }
                    Err(e) if e.is_transient() => {
                        let failures = transient.entry(info.key()).or_insert(0);
                        *failures += 1;
                        if *failures > self.options.max_transient_errors {
                            return Err(e);
                        }
                        warn!(
                            resource = %info.display_name(),
                            attempt = *failures,
                            error = %e,
                            "transient error while waiting, retrying"
                        );
                        outstanding.push(pending_line(info, probe));
                    }
                    Err(e) => return Err(e),
                }
            }

            *pending = outstanding;
            if pending.is_empty() {
                debug!(round, count = resources.len(), "wait complete");
                return Ok(());
            }
            debug!(round, pending = pending.len(), "resources not ready yet");
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn check(&self, probe: &Probe<C>, info: &ResourceInfo) -> Result<bool> {
        match probe {
            Probe::Ready(checker) => checker.is_ready(info).await,
            Probe::Deleted => Ok(self.cluster.get(info).await?.is_none()),
        }
    }

    async fn watch_hooks(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        for info in resources {
            let Some(kind) = hook_kind(info) else {
                debug!(resource = %info.display_name(), "not a hook kind, skipping");
                continue;
            };
            debug!(resource = %info.display_name(), "watching hook");
            match tokio::time::timeout_at(deadline, self.follow_hook(info, kind)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(KubeError::WaitTimeout {
                        not_ready: vec![format!("{}: {} not ready", info.name, info.kind())],
                        timeout,
                    });
                }
            }
        }
        Ok(())
    }

    async fn follow_hook(&self, info: &ResourceInfo, kind: BuiltinKind) -> Result<()> {
        let mut events = self.cluster.watch(info);
        while let Some(event) = events.next().await {
            match event {
                Ok(object) => {
                    if hook_finished(kind, object.as_ref())? {
                        return Ok(());
                    }
                }
                Err(e) => warn!(resource = %info.display_name(), error = %e, "watch failed"),
            }
        }
        Err(KubeError::Watch(format!(
            "watch of {} closed before it finished",
            info.display_name()
        )))
    }
}

fn pending_line<C>(info: &ResourceInfo, probe: &Probe<C>) -> String {
    match probe {
        Probe::Ready(_) => format!("{}: {} not ready", info.name, info.kind()),
        Probe::Deleted => format!("{}: {} not deleted", info.name, info.kind()),
    }
}

/// Whether a hook object reached its end state
///
/// A deleted object counts as finished. Failed Jobs and Pods are errors.
pub fn hook_finished(kind: BuiltinKind, object: Option<&DynamicObject>) -> Result<bool> {
    let Some(object) = object else {
        return Ok(true);
    };
    let value = serde_json::to_value(object)?;

    match kind {
        BuiltinKind::Job => {
            let job: Job = decode(&value)?;
            let status = job.status.as_ref();
            let has_condition = |type_: &str| {
                status
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == type_ && c.status == "True")
                    })
            };
            if has_condition("Failed") {
                return Err(KubeError::JobFailed {
                    name: job.metadata.name.clone().unwrap_or_default(),
                    namespace: job.metadata.namespace.clone().unwrap_or_default(),
                    failed: status.and_then(|s| s.failed).unwrap_or(0),
                    backoff_limit: job
                        .spec
                        .as_ref()
                        .and_then(|s| s.backoff_limit)
                        .unwrap_or(DEFAULT_BACKOFF_LIMIT),
                });
            }
            Ok(has_condition("Complete"))
        }
        BuiltinKind::Pod => {
            let pod: Pod = decode(&value)?;
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Succeeded") => Ok(true),
                Some("Failed") => Err(KubeError::PodFailed {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                }),
                _ => Ok(false),
            }
        }
        _ => Ok(true),
    }
}

#[async_trait]
impl<C: ClusterApi> Waiter for LegacyWaiter<C> {
    async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.poll(resources, timeout, Probe::Ready(self.checker(false)))
            .await
    }

    async fn wait_with_jobs(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.poll(resources, timeout, Probe::Ready(self.checker(true)))
            .await
    }

    async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.watch_hooks(resources, timeout).await
    }

    async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.poll(resources, timeout, Probe::Deleted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Delay, Failure, MockCluster, Verb};
    use crate::resource::gvk_from_type_meta;
    use serde_json::{Value, json};

    fn pod(name: &str, ready: bool) -> Value {
        let ready = if ready { "True" } else { "False" };
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "containers": [] },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": ready }],
            },
        })
    }

    fn job(status: Value) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "migrate", "namespace": "default" },
            "spec": { "backoffLimit": 2, "template": {} },
            "status": status,
        })
    }

    fn stored(cluster: &MockCluster, value: Value) -> ResourceInfo {
        let object: DynamicObject = serde_json::from_value(value).unwrap();
        let stored = cluster.insert(object).unwrap();
        let gvk = gvk_from_type_meta(stored.types.as_ref().unwrap());
        ResourceInfo::new(stored, cluster.resolve(&gvk).unwrap()).unwrap()
    }

    fn options() -> WaitOptions {
        WaitOptions {
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn waiter(cluster: &MockCluster, options: WaitOptions) -> LegacyWaiter<MockCluster> {
        LegacyWaiter::new(Arc::new(cluster.clone()), options)
    }

    fn mark_ready(cluster: &MockCluster, name: &str) {
        cluster
            .modify("Pod", Some("default"), name, |p| {
                p.data["status"]["conditions"][0]["status"] = json!("True");
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_ready() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", false))].into();

        let readiness = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                mark_ready(&cluster, "api");
            })
        };

        waiter(&cluster, options())
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap();
        readiness.await.unwrap();
        assert!(cluster.operation_counts().gets >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_round() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![
            stored(&cluster, pod("api", true)),
            stored(&cluster, pod("worker", false)),
        ]
        .into();

        let err = waiter(&cluster, options())
            .wait(&resources, Duration::from_secs(10))
            .await
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r"
        worker: Pod not ready
        context deadline exceeded after 10s
        ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_a_round_keeps_last_breakdown() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", false))].into();
        cluster.inject_delay(Delay::new(Verb::Get, Duration::from_millis(600)));

        // the second round is still reading when the deadline passes
        let err = waiter(&cluster, options())
            .wait(&resources, Duration::from_millis(1800))
            .await
            .unwrap_err();
        let KubeError::WaitTimeout { not_ready, .. } = err else {
            panic!("expected a timeout");
        };
        assert_eq!(not_ready, vec!["api: Pod not ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_first_round_lists_everything() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![
            stored(&cluster, pod("api", true)),
            stored(&cluster, pod("worker", false)),
        ]
        .into();
        cluster.inject_delay(Delay::new(Verb::Get, Duration::from_secs(5)));

        let err = waiter(&cluster, options())
            .wait(&resources, Duration::from_secs(1))
            .await
            .unwrap_err();
        let KubeError::WaitTimeout { not_ready, .. } = err else {
            panic!("expected a timeout");
        };
        assert_eq!(not_ready, vec!["api: Pod not ready", "worker: Pod not ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", true))].into();
        cluster.inject_failure(
            Failure::new(Verb::Get, 503, "ServiceUnavailable")
                .for_object("Pod", "api")
                .times(3),
        );

        waiter(&cluster, options())
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cluster.operation_counts().gets, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_have_a_limit() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", true))].into();
        cluster.inject_failure(
            Failure::new(Verb::Get, 503, "ServiceUnavailable").for_object("Pod", "api"),
        );

        let options = WaitOptions {
            max_transient_errors: 2,
            ..options()
        };
        let err = waiter(&cluster, options)
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(cluster.operation_counts().gets, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_abort() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", false))].into();
        cluster.inject_failure(Failure::new(Verb::Get, 403, "Forbidden"));

        let err = waiter(&cluster, options())
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(403));
        assert_eq!(cluster.operation_counts().gets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_aborts_wait_with_jobs() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, job(json!({ "failed": 3 })))].into();
        let waiter = waiter(&cluster, options());

        waiter.wait(&resources, Duration::from_secs(5)).await.unwrap();

        let err = waiter
            .wait_with_jobs(&resources, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KubeError::JobFailed {
                failed: 3,
                backoff_limit: 2,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_delete() {
        let cluster = MockCluster::new();
        let resources: ResourceList = vec![stored(&cluster, pod("api", true))].into();

        let waiter = waiter(&cluster, options());
        let err = waiter
            .wait_for_delete(&resources, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("api: Pod not deleted"));

        cluster.remove("Pod", Some("default"), "api");
        waiter
            .wait_for_delete(&resources, Duration::from_secs(3))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_until_ready_follows_hooks() {
        let cluster = MockCluster::new();
        let config = stored(
            &cluster,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "cfg", "namespace": "default" },
            }),
        );
        let migrate = stored(&cluster, job(json!({})));
        let resources: ResourceList = vec![config, migrate].into();

        let completion = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cluster
                    .modify("Job", Some("default"), "migrate", |j| {
                        j.data["status"] = json!({
                            "succeeded": 1,
                            "conditions": [{ "type": "Complete", "status": "True" }],
                        });
                    })
                    .unwrap();
            })
        };

        waiter(&cluster, options())
            .watch_until_ready(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        completion.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_until_ready_fails_on_failed_pod() {
        let cluster = MockCluster::new();
        let mut hook = pod("smoke-test", false);
        hook["status"]["phase"] = json!("Failed");
        let resources: ResourceList = vec![stored(&cluster, hook)].into();

        let err = waiter(&cluster, options())
            .watch_until_ready(&resources, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::PodFailed { ref name, .. } if name == "smoke-test"));
    }

    #[test]
    fn test_hook_finished() {
        let object = |value: Value| serde_json::from_value::<DynamicObject>(value).unwrap();

        assert!(hook_finished(BuiltinKind::Job, None).unwrap());
        assert!(!hook_finished(BuiltinKind::Job, Some(&object(job(json!({}))))).unwrap());
        assert!(
            hook_finished(
                BuiltinKind::Job,
                Some(&object(job(json!({
                    "conditions": [{ "type": "Complete", "status": "True" }]
                }))))
            )
            .unwrap()
        );
        assert!(
            hook_finished(
                BuiltinKind::Job,
                Some(&object(job(json!({
                    "failed": 3,
                    "conditions": [{ "type": "Failed", "status": "True" }]
                }))))
            )
            .is_err()
        );

        let mut done = pod("smoke-test", false);
        done["status"]["phase"] = json!("Succeeded");
        assert!(hook_finished(BuiltinKind::Pod, Some(&object(done))).unwrap());
        assert!(!hook_finished(BuiltinKind::Pod, Some(&object(pod("smoke-test", true)))).unwrap());
    }
}
