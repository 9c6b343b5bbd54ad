//! Watch-based waiting on computed object status

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{Waiter, hook_kind};
use crate::cluster::ClusterApi;
use crate::error::{KubeError, Result};
use crate::kinds::BuiltinKind;
use crate::resource::{ResourceInfo, ResourceList};

/// Condensed state of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Being reconciled by its controller
    InProgress,
    /// Reconciliation failed and will not recover on its own
    Failed,
    /// Fully reconciled
    Current,
    /// Marked for deletion
    Terminating,
    /// Absent from the cluster
    NotFound,
    /// Could not be determined
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::InProgress => "InProgress",
            Status::Failed => "Failed",
            Status::Current => "Current",
            Status::Terminating => "Terminating",
            Status::NotFound => "NotFound",
            Status::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

type StatusFn = fn(Option<BuiltinKind>, Option<&DynamicObject>) -> Status;

fn field<'a>(data: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(data, |value, key| value.get(key))
}

fn int(data: &Value, path: &[&str]) -> Option<i64> {
    field(data, path).and_then(Value::as_i64)
}

fn text<'a>(data: &'a Value, path: &[&str]) -> Option<&'a str> {
    field(data, path).and_then(Value::as_str)
}

/// Status of the first condition of a type
fn condition<'a>(data: &'a Value, type_: &str) -> Option<&'a Value> {
    field(data, &["status", "conditions"])?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn condition_is(data: &Value, type_: &str, status: &str) -> bool {
    condition(data, type_)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some(status)
}

/// Compute the status of a live object
///
/// `None` means the object does not exist. Kinds without specific rules
/// follow the `Stalled`, `Reconciling` and `Ready` conditions when present.
pub fn compute_status(kind: Option<BuiltinKind>, object: Option<&DynamicObject>) -> Status {
    let Some(object) = object else {
        return Status::NotFound;
    };
    if object.metadata.deletion_timestamp.is_some() {
        return Status::Terminating;
    }

    let data = &object.data;
    let generation = object.metadata.generation.unwrap_or(0);
    match int(data, &["status", "observedGeneration"]) {
        Some(observed) if observed < generation => return Status::InProgress,
        None if kind.is_some_and(is_workload) => return Status::InProgress,
        _ => {}
    }

    match kind {
        Some(BuiltinKind::Deployment) => deployment_status(data),
        Some(BuiltinKind::StatefulSet) => stateful_set_status(data),
        Some(BuiltinKind::DaemonSet) => daemon_set_status(data),
        Some(BuiltinKind::ReplicaSet) => replica_set_status(data),
        Some(BuiltinKind::Pod) => pod_status(data),
        Some(BuiltinKind::Job) => job_status(data),
        Some(BuiltinKind::PersistentVolumeClaim) => {
            if text(data, &["status", "phase"]) == Some("Bound") {
                Status::Current
            } else {
                Status::InProgress
            }
        }
        Some(BuiltinKind::Service) => service_status(data),
        Some(BuiltinKind::CustomResourceDefinition) => crd_status(data),
        _ => generic_status(data),
    }
}

/// Like [`compute_status`], but Pods are only current once they succeeded
pub fn compute_hook_status(kind: Option<BuiltinKind>, object: Option<&DynamicObject>) -> Status {
    match (kind, object) {
        (Some(BuiltinKind::Pod), Some(pod)) if pod.metadata.deletion_timestamp.is_none() => {
            match text(&pod.data, &["status", "phase"]) {
                Some("Succeeded") => Status::Current,
                Some("Failed") => Status::Failed,
                _ => Status::InProgress,
            }
        }
        _ => compute_status(kind, object),
    }
}

fn is_workload(kind: BuiltinKind) -> bool {
    matches!(
        kind,
        BuiltinKind::Deployment
            | BuiltinKind::StatefulSet
            | BuiltinKind::DaemonSet
            | BuiltinKind::ReplicaSet
    )
}

fn deployment_status(data: &Value) -> Status {
    let progressing = condition(data, "Progressing");
    if progressing
        .and_then(|c| c.get("reason"))
        .and_then(Value::as_str)
        == Some("ProgressDeadlineExceeded")
    {
        return Status::Failed;
    }

    let replicas = int(data, &["spec", "replicas"]).unwrap_or(1);
    let total = int(data, &["status", "replicas"]).unwrap_or(0);
    let updated = int(data, &["status", "updatedReplicas"]).unwrap_or(0);
    let ready = int(data, &["status", "readyReplicas"]).unwrap_or(0);
    let available = int(data, &["status", "availableReplicas"]).unwrap_or(0);

    // old pods still terminating count towards total
    if updated < replicas || total > updated || available < updated || ready < replicas {
        return Status::InProgress;
    }
    Status::Current
}

fn stateful_set_status(data: &Value) -> Status {
    if text(data, &["spec", "updateStrategy", "type"]) == Some("OnDelete") {
        return Status::Current;
    }

    let replicas = int(data, &["spec", "replicas"]).unwrap_or(1);
    let partition = int(data, &["spec", "updateStrategy", "rollingUpdate", "partition"]).unwrap_or(0);
    let ready = int(data, &["status", "readyReplicas"]).unwrap_or(0);
    let updated = int(data, &["status", "updatedReplicas"]).unwrap_or(0);
    let current = int(data, &["status", "currentReplicas"]).unwrap_or(0);

    if ready < replicas {
        return Status::InProgress;
    }
    if partition > 0 {
        return if updated < replicas - partition {
            Status::InProgress
        } else {
            Status::Current
        };
    }
    if current < replicas
        || text(data, &["status", "currentRevision"]) != text(data, &["status", "updateRevision"])
    {
        return Status::InProgress;
    }
    Status::Current
}

fn daemon_set_status(data: &Value) -> Status {
    let Some(desired) = int(data, &["status", "desiredNumberScheduled"]) else {
        return Status::InProgress;
    };
    let updated = int(data, &["status", "updatedNumberScheduled"]).unwrap_or(0);
    let available = int(data, &["status", "numberAvailable"]).unwrap_or(0);
    let ready = int(data, &["status", "numberReady"]).unwrap_or(0);

    if updated < desired || available < desired || ready < desired {
        return Status::InProgress;
    }
    Status::Current
}

fn replica_set_status(data: &Value) -> Status {
    if condition_is(data, "ReplicaFailure", "True") {
        return Status::Failed;
    }
    let replicas = int(data, &["spec", "replicas"]).unwrap_or(1);
    let ready = int(data, &["status", "readyReplicas"]).unwrap_or(0);
    let available = int(data, &["status", "availableReplicas"]).unwrap_or(0);
    if ready < replicas || available < replicas {
        return Status::InProgress;
    }
    Status::Current
}

fn pod_status(data: &Value) -> Status {
    match text(data, &["status", "phase"]) {
        Some("Succeeded") => Status::Current,
        Some("Failed") => Status::Failed,
        Some("Running") if condition_is(data, "Ready", "True") => Status::Current,
        _ => Status::InProgress,
    }
}

fn job_status(data: &Value) -> Status {
    if condition_is(data, "Failed", "True") {
        Status::Failed
    } else if condition_is(data, "Complete", "True") {
        Status::Current
    } else {
        Status::InProgress
    }
}

fn service_status(data: &Value) -> Status {
    if text(data, &["spec", "type"]) != Some("LoadBalancer") {
        return Status::Current;
    }
    let has = |path: &[&str]| {
        field(data, path)
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty())
    };
    if has(&["spec", "externalIPs"]) || has(&["status", "loadBalancer", "ingress"]) {
        Status::Current
    } else {
        Status::InProgress
    }
}

fn crd_status(data: &Value) -> Status {
    if condition_is(data, "Established", "True") {
        Status::Current
    } else if condition_is(data, "NamesAccepted", "False") {
        Status::Failed
    } else {
        Status::InProgress
    }
}

fn generic_status(data: &Value) -> Status {
    if condition_is(data, "Stalled", "True") {
        Status::Failed
    } else if condition_is(data, "Reconciling", "True") || condition_is(data, "Ready", "False") {
        Status::InProgress
    } else {
        Status::Current
    }
}

/// Waits by watching every object and computing its [`Status`]
pub struct StatusWaiter<C> {
    cluster: Arc<C>,
}

impl<C: ClusterApi> StatusWaiter<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    async fn wait_ready(
        &self,
        resources: &ResourceList,
        timeout: Duration,
        with_jobs: bool,
    ) -> Result<()> {
        let targets: Vec<&ResourceInfo> = resources
            .iter()
            .filter(|info| match BuiltinKind::from_gvk(&info.gvk) {
                Some(BuiltinKind::Job) => with_jobs,
                Some(BuiltinKind::Deployment) => !is_paused(info),
                _ => true,
            })
            .collect();
        self.wait_for(&targets, Status::Current, timeout, compute_status)
            .await
    }

    /// Follow `targets` until each reaches `desired`
    ///
    /// An object that cannot be observed counts as deleted when waiting for
    /// deletion.
    async fn wait_for(
        &self,
        targets: &[&ResourceInfo],
        desired: Status,
        timeout: Duration,
        compute: StatusFn,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        let kinds: Vec<Option<BuiltinKind>> = targets
            .iter()
            .map(|info| BuiltinKind::from_gvk(&info.gvk))
            .collect();
        let mut observed: Vec<Option<Status>> = vec![None; targets.len()];
        let mut events = stream::select_all(
            targets
                .iter()
                .enumerate()
                .map(|(index, info)| self.cluster.watch(info).map(move |event| (index, event))),
        );

        debug!(count = targets.len(), %desired, "waiting for resources");
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = events.next() => {
                    let Some((index, event)) = next else {
                        debug!(count = targets.len(), "every watch ended before the resources were ready");
                        break;
                    };
                    let status = match event {
                        Ok(object) => compute(kinds[index], object.as_ref()),
                        Err(e) => {
                            warn!(resource = %targets[index].display_name(), error = %e, "watch failed");
                            Status::Unknown
                        }
                    };
                    trace!(resource = %targets[index].display_name(), %status, "status changed");
                    observed[index] = Some(status);

                    if observed.iter().all(|s| s.is_some_and(|s| reached(s, desired))) {
                        debug!(count = targets.len(), %desired, "all resources reached status");
                        return Ok(());
                    }
                }
                () = &mut deadline => break,
            }
        }

        let not_ready = targets
            .iter()
            .zip(&observed)
            .filter(|(_, status)| !status.is_some_and(|s| reached(s, desired)))
            .map(|(info, status)| {
                format!(
                    "{}: {} not ready, status: {}",
                    info.name,
                    info.kind(),
                    status.unwrap_or(Status::Unknown)
                )
            })
            .collect();
        Err(KubeError::WaitTimeout { not_ready, timeout })
    }
}

fn reached(status: Status, desired: Status) -> bool {
    status == desired || (desired == Status::NotFound && status == Status::Unknown)
}

fn is_paused(info: &ResourceInfo) -> bool {
    info.object.data.pointer("/spec/paused") == Some(&Value::Bool(true))
}

#[async_trait]
impl<C: ClusterApi> Waiter for StatusWaiter<C> {
    async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.wait_ready(resources, timeout, false).await
    }

    async fn wait_with_jobs(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        self.wait_ready(resources, timeout, true).await
    }

    async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        let hooks: Vec<&ResourceInfo> = resources
            .iter()
            .filter(|info| hook_kind(info).is_some())
            .collect();
        self.wait_for(&hooks, Status::Current, timeout, compute_hook_status)
            .await
    }

    async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<()> {
        let targets: Vec<&ResourceInfo> = resources.iter().collect();
        self.wait_for(&targets, Status::NotFound, timeout, compute_status)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::resource::gvk_from_type_meta;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn deployment(ready: i64) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default", "generation": 1 },
            "spec": { "replicas": 2 },
            "status": {
                "observedGeneration": 1,
                "replicas": 2,
                "updatedReplicas": 2,
                "readyReplicas": ready,
                "availableReplicas": ready,
            },
        })
    }

    fn job(conditions: Value) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "migrate", "namespace": "default" },
            "spec": { "template": {} },
            "status": { "conditions": conditions },
        })
    }

    fn tracked(cluster: &MockCluster, value: Value) -> ResourceInfo {
        let object = object(value);
        let gvk = gvk_from_type_meta(object.types.as_ref().unwrap());
        ResourceInfo::new(object, cluster.resolve(&gvk).unwrap()).unwrap()
    }

    fn stored(cluster: &MockCluster, value: Value) -> ResourceInfo {
        let info = tracked(cluster, value);
        cluster.insert(info.object.clone()).unwrap();
        info
    }

    fn waiter(cluster: &MockCluster) -> StatusWaiter<MockCluster> {
        StatusWaiter::new(Arc::new(cluster.clone()))
    }

    #[test]
    fn test_deployment_status() {
        let kind = Some(BuiltinKind::Deployment);
        assert_eq!(compute_status(kind, Some(&object(deployment(2)))), Status::Current);
        assert_eq!(compute_status(kind, Some(&object(deployment(1)))), Status::InProgress);

        let mut stale = deployment(2);
        stale["metadata"]["generation"] = json!(2);
        assert_eq!(compute_status(kind, Some(&object(stale))), Status::InProgress);

        let mut stuck = deployment(1);
        stuck["status"]["conditions"] = json!([
            { "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded" }
        ]);
        assert_eq!(compute_status(kind, Some(&object(stuck))), Status::Failed);
    }

    #[test]
    fn test_missing_and_terminating() {
        assert_eq!(compute_status(None, None), Status::NotFound);

        let mut doomed = deployment(2);
        doomed["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        assert_eq!(
            compute_status(Some(BuiltinKind::Deployment), Some(&object(doomed))),
            Status::Terminating
        );
    }

    #[test]
    fn test_pod_status_for_workloads_and_hooks() {
        let running = object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "p" },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": "True" }],
            },
        }));
        let kind = Some(BuiltinKind::Pod);
        assert_eq!(compute_status(kind, Some(&running)), Status::Current);
        assert_eq!(compute_hook_status(kind, Some(&running)), Status::InProgress);

        let mut done = running.clone();
        done.data["status"]["phase"] = json!("Succeeded");
        assert_eq!(compute_hook_status(kind, Some(&done)), Status::Current);

        let mut failed = running;
        failed.data["status"]["phase"] = json!("Failed");
        assert_eq!(compute_hook_status(kind, Some(&failed)), Status::Failed);
    }

    #[test]
    fn test_job_and_generic_status() {
        let kind = Some(BuiltinKind::Job);
        let complete = object(job(json!([{ "type": "Complete", "status": "True" }])));
        let failed = object(job(json!([{ "type": "Failed", "status": "True" }])));
        let running = object(job(json!([])));
        assert_eq!(compute_status(kind, Some(&complete)), Status::Current);
        assert_eq!(compute_status(kind, Some(&failed)), Status::Failed);
        assert_eq!(compute_status(kind, Some(&running)), Status::InProgress);

        let widget = |conditions: Value| {
            object(json!({
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "metadata": { "name": "w" },
                "status": { "conditions": conditions },
            }))
        };
        assert_eq!(compute_status(None, Some(&widget(json!([])))), Status::Current);
        assert_eq!(
            compute_status(None, Some(&widget(json!([{ "type": "Ready", "status": "False" }])))),
            Status::InProgress
        );
        assert_eq!(
            compute_status(None, Some(&widget(json!([{ "type": "Stalled", "status": "True" }])))),
            Status::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_current() {
        let cluster = MockCluster::new();
        let web = stored(&cluster, deployment(0));
        let resources: ResourceList = vec![web].into();

        let rollout = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cluster
                    .modify("Deployment", Some("default"), "web", |d| {
                        d.data["status"]["readyReplicas"] = json!(2);
                        d.data["status"]["availableReplicas"] = json!(2);
                    })
                    .unwrap();
            })
        };

        let started = tokio::time::Instant::now();
        waiter(&cluster)
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(60));
        rollout.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_lists_pending_resources() {
        let cluster = MockCluster::new();
        let web = stored(&cluster, deployment(1));
        let missing = tracked(
            &cluster,
            json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": "data", "namespace": "default" },
            }),
        );
        let resources: ResourceList = vec![web, missing].into();

        let err = waiter(&cluster)
            .wait(&resources, Duration::from_secs(30))
            .await
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r"
        web: Deployment not ready, status: InProgress
        data: PersistentVolumeClaim not ready, status: NotFound
        context deadline exceeded after 30s
        ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watches_end_the_wait_early() {
        let cluster = MockCluster::new();
        cluster.end_watches_after_snapshot();
        let resources: ResourceList = vec![stored(&cluster, deployment(1))].into();

        let started = tokio::time::Instant::now();
        let err = waiter(&cluster)
            .wait(&resources, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(60));
        let KubeError::WaitTimeout { not_ready, .. } = err else {
            panic!("expected a timeout");
        };
        assert_eq!(not_ready, vec!["web: Deployment not ready, status: InProgress"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_and_paused_deployments_are_skipped() {
        let cluster = MockCluster::new();
        let migrate = stored(&cluster, job(json!([])));
        let mut paused = deployment(0);
        paused["spec"]["paused"] = json!(true);
        let paused = stored(&cluster, paused);
        let resources: ResourceList = vec![migrate, paused].into();

        let waiter = waiter(&cluster);
        waiter.wait(&resources, Duration::from_secs(10)).await.unwrap();

        let err = waiter
            .wait_with_jobs(&resources, Duration::from_secs(10))
            .await
            .unwrap_err();
        let KubeError::WaitTimeout { not_ready, .. } = err else {
            panic!("expected a timeout");
        };
        assert_eq!(not_ready, vec!["migrate: Job not ready, status: InProgress"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_delete() {
        let cluster = MockCluster::new();
        let web = stored(&cluster, deployment(2));
        let never_created = tracked(&cluster, job(json!([])));
        let resources: ResourceList = vec![web, never_created].into();

        let cleanup = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                cluster.remove("Deployment", Some("default"), "web");
            })
        };

        waiter(&cluster)
            .wait_for_delete(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        cleanup.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_until_ready_follows_hooks_only() {
        let cluster = MockCluster::new();
        let config = stored(
            &cluster,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "cfg", "namespace": "default" },
            }),
        );
        let migrate = stored(&cluster, job(json!([])));
        let resources: ResourceList = vec![config, migrate].into();

        let finish = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cluster
                    .modify("Job", Some("default"), "migrate", |j| {
                        j.data["status"]["conditions"] = json!([{ "type": "Complete", "status": "True" }]);
                    })
                    .unwrap();
            })
        };

        waiter(&cluster)
            .watch_until_ready(&resources, Duration::from_secs(30))
            .await
            .unwrap();
        finish.await.unwrap();
    }
}
