//! Readiness checks per kind
//!
//! [`ReadyChecker::is_ready`] reads the live object and dispatches on its
//! [`BuiltinKind`]. The predicates themselves are plain functions over
//! k8s-openapi types so they can be checked without a cluster. Kinds without a
//! predicate, custom resources included, are always ready.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, Pod, PodTemplateSpec, ReplicationController, Service,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use tracing::{debug, trace};

use crate::cluster::ClusterApi;
use crate::error::{KubeError, Result};
use crate::kinds::{BuiltinKind, decode};
use crate::resource::ResourceInfo;

/// Label added by the deployment controller to every ReplicaSet template
const POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Job retries before it is considered failed, when the Job sets none
pub(crate) const DEFAULT_BACKOFF_LIMIT: i32 = 6;

const ROLLING_UPDATE: &str = "RollingUpdate";

/// Knobs fixed when a checker is built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyCheckerConfig {
    /// Wait for Jobs to complete instead of treating them as ready
    pub check_jobs: bool,
    /// Report paused Deployments as ready
    pub paused_as_ready: bool,
}

/// Decides whether live objects are ready
pub struct ReadyChecker<C> {
    cluster: Arc<C>,
    config: ReadyCheckerConfig,
}

impl<C: ClusterApi> ReadyChecker<C> {
    pub fn new(cluster: Arc<C>, config: ReadyCheckerConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> ReadyCheckerConfig {
        self.config
    }

    /// Check one object against the cluster
    ///
    /// A missing object is not ready. A Job past its backoff limit is an
    /// error, not a "not ready" answer.
    pub async fn is_ready(&self, info: &ResourceInfo) -> Result<bool> {
        let Some(kind) = BuiltinKind::from_gvk(&info.gvk) else {
            return Ok(true);
        };
        if !has_predicate(kind) || (kind == BuiltinKind::Job && !self.config.check_jobs) {
            return Ok(true);
        }

        let Some(live) = self.cluster.get(info).await? else {
            debug!(resource = %info.display_name(), "not found yet");
            return Ok(false);
        };
        let value = serde_json::to_value(&live)?;

        let ready = match kind {
            BuiltinKind::Pod => pod_ready(&decode::<Pod>(&value)?),
            BuiltinKind::Job => job_ready(&decode::<Job>(&value)?)?,
            BuiltinKind::Deployment => {
                let deployment = decode::<Deployment>(&value)?;
                self.deployment_is_ready(info, &live, &deployment).await?
            }
            BuiltinKind::DaemonSet => daemon_set_ready(&decode::<DaemonSet>(&value)?),
            BuiltinKind::StatefulSet => stateful_set_ready(&decode::<StatefulSet>(&value)?),
            BuiltinKind::Service => service_ready(&decode::<Service>(&value)?),
            BuiltinKind::PersistentVolumeClaim => {
                volume_ready(&decode::<PersistentVolumeClaim>(&value)?)
            }
            BuiltinKind::CustomResourceDefinition => {
                crd_ready(&decode::<CustomResourceDefinition>(&value)?)
            }
            BuiltinKind::ReplicaSet => {
                replica_set_ready(&decode::<ReplicaSet>(&value)?)
                    && self.pods_ready(info, kind, &live).await?
            }
            BuiltinKind::ReplicationController => {
                replication_controller_ready(&decode::<ReplicationController>(&value)?)
                    && self.pods_ready(info, kind, &live).await?
            }
            _ => true,
        };

        if ready {
            trace!(resource = %info.display_name(), "ready");
        } else {
            debug!(resource = %info.display_name(), "not ready");
        }
        Ok(ready)
    }

    async fn deployment_is_ready(
        &self,
        info: &ResourceInfo,
        live: &DynamicObject,
        deployment: &Deployment,
    ) -> Result<bool> {
        if deployment.spec.as_ref().and_then(|s| s.paused).unwrap_or(false) {
            return Ok(self.config.paused_as_ready);
        }
        match self.new_replica_set(info, live, deployment).await? {
            Some(rs) => Ok(deployment_ready(&rs, deployment)),
            None => {
                debug!(resource = %info.display_name(), "no ReplicaSet for the current template");
                Ok(false)
            }
        }
    }

    /// The ReplicaSet the deployment controller created for the current template
    async fn new_replica_set(
        &self,
        info: &ResourceInfo,
        live: &DynamicObject,
        deployment: &Deployment,
    ) -> Result<Option<ReplicaSet>> {
        let Some(selector) = BuiltinKind::Deployment.pod_selector(&live.data) else {
            return Ok(None);
        };
        let Some(template) = deployment.spec.as_ref().map(|s| without_hash(&s.template)) else {
            return Ok(None);
        };
        let uid = deployment.metadata.uid.as_deref();

        let mapping = self
            .cluster
            .resolve(&GroupVersionKind::gvk("apps", "v1", "ReplicaSet"))?;
        let candidates = self
            .cluster
            .list(&mapping, info.namespace.as_deref(), &selector)
            .await?;

        for object in candidates {
            let rs: ReplicaSet = decode(&serde_json::to_value(&object)?)?;
            let controlled = rs
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.controller == Some(true) && Some(owner.uid.as_str()) == uid);
            let same_template = rs
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .is_some_and(|t| without_hash(t) == template);
            if controlled && same_template {
                return Ok(Some(rs));
            }
        }
        Ok(None)
    }

    /// Every pod selected by a workload passes [`pod_ready`]
    async fn pods_ready(
        &self,
        info: &ResourceInfo,
        kind: BuiltinKind,
        live: &DynamicObject,
    ) -> Result<bool> {
        let Some(selector) = kind.pod_selector(&live.data) else {
            return Ok(true);
        };
        let mapping = self.cluster.resolve(&GroupVersionKind::gvk("", "v1", "Pod"))?;
        for object in self
            .cluster
            .list(&mapping, info.namespace.as_deref(), &selector)
            .await?
        {
            let pod: Pod = decode(&serde_json::to_value(&object)?)?;
            if !pod_ready(&pod) {
                debug!(
                    resource = %info.display_name(),
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    "pod not ready"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn has_predicate(kind: BuiltinKind) -> bool {
    matches!(
        kind,
        BuiltinKind::Pod
            | BuiltinKind::Job
            | BuiltinKind::Deployment
            | BuiltinKind::DaemonSet
            | BuiltinKind::StatefulSet
            | BuiltinKind::Service
            | BuiltinKind::PersistentVolumeClaim
            | BuiltinKind::CustomResourceDefinition
            | BuiltinKind::ReplicaSet
            | BuiltinKind::ReplicationController
    )
}

fn without_hash(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut template = template.clone();
    if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
        labels.remove(POD_TEMPLATE_HASH);
    }
    template
}

fn is_rolling_update(strategy_type: Option<&str>) -> bool {
    strategy_type.is_none_or(|t| t == ROLLING_UPDATE)
}

/// Resolve an absolute or percentage value against `total`
///
/// Percentages are rounded up or down as asked; strings that are not
/// percentages are rejected.
pub fn scaled_value(value: &IntOrString, total: i32, round_up: bool) -> Result<i32> {
    match value {
        IntOrString::Int(n) => Ok(*n),
        IntOrString::String(s) => {
            let percent: i32 = s
                .strip_suffix('%')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| {
                    KubeError::InvalidManifest(format!(
                        "invalid value for IntOrString: {s:?} is not a percentage"
                    ))
                })?;
            let scaled = f64::from(percent) * f64::from(total) / 100.0;
            let rounded = if round_up { scaled.ceil() } else { scaled.floor() };
            Ok(rounded as i32)
        }
    }
}

/// Pods a Deployment may have unavailable during a rolling update
///
/// Surge rounds up and unavailability rounds down; when both resolve to
/// zero one pod may be unavailable. Never more than the desired replicas.
pub fn max_unavailable(deployment: &Deployment) -> i32 {
    let Some(spec) = deployment.spec.as_ref() else {
        return 0;
    };
    let replicas = spec.replicas.unwrap_or(1);
    let strategy = spec.strategy.as_ref();
    if !is_rolling_update(strategy.and_then(|s| s.type_.as_deref())) || replicas == 0 {
        return 0;
    }

    let default_fraction = IntOrString::String("25%".to_string());
    let rolling = strategy.and_then(|s| s.rolling_update.as_ref());
    let surge = rolling
        .and_then(|r| r.max_surge.as_ref())
        .unwrap_or(&default_fraction);
    let unavailable = rolling
        .and_then(|r| r.max_unavailable.as_ref())
        .unwrap_or(&default_fraction);

    let (Ok(surge), Ok(unavailable)) = (
        scaled_value(surge, replicas, true),
        scaled_value(unavailable, replicas, false),
    ) else {
        return 0;
    };
    let unavailable = if surge == 0 && unavailable == 0 {
        1
    } else {
        unavailable
    };
    unavailable.min(replicas)
}

pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Ready once `succeeded >= completions`; an error once failures pass the backoff limit
pub fn job_ready(job: &Job) -> Result<bool> {
    let spec = job.spec.as_ref();
    let status = job.status.as_ref();

    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let backoff_limit = spec
        .and_then(|s| s.backoff_limit)
        .unwrap_or(DEFAULT_BACKOFF_LIMIT);
    if failed > backoff_limit {
        return Err(KubeError::JobFailed {
            name: job.metadata.name.clone().unwrap_or_default(),
            namespace: job.metadata.namespace.clone().unwrap_or_default(),
            failed,
            backoff_limit,
        });
    }

    let completions = spec.and_then(|s| s.completions).unwrap_or(1);
    Ok(status.and_then(|s| s.succeeded).unwrap_or(0) >= completions)
}

/// Ready when the new ReplicaSet has enough ready pods
///
/// Both controllers must have observed the latest generation first.
pub fn deployment_ready(rs: &ReplicaSet, deployment: &Deployment) -> bool {
    if !replica_set_ready(rs) {
        return false;
    }
    let observed = deployment.status.as_ref().and_then(|s| s.observed_generation);
    if observed != deployment.metadata.generation {
        return false;
    }

    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let expected_ready = replicas - max_unavailable(deployment);
    let ready = rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    ready >= expected_ready
}

pub fn replica_set_ready(rs: &ReplicaSet) -> bool {
    rs.status.as_ref().and_then(|s| s.observed_generation) == rs.metadata.generation
}

pub fn replication_controller_ready(rc: &ReplicationController) -> bool {
    rc.status.as_ref().and_then(|s| s.observed_generation) == rc.metadata.generation
}

pub fn daemon_set_ready(ds: &DaemonSet) -> bool {
    let observed = ds.status.as_ref().and_then(|s| s.observed_generation);
    if observed != ds.metadata.generation {
        return false;
    }

    let strategy = ds.spec.as_ref().and_then(|s| s.update_strategy.as_ref());
    if !is_rolling_update(strategy.and_then(|s| s.type_.as_deref())) {
        return true;
    }

    let Some(status) = ds.status.as_ref() else {
        return false;
    };
    let desired = status.desired_number_scheduled;
    if status.updated_number_scheduled.unwrap_or(0) != desired {
        return false;
    }

    let max_unavailable = match strategy
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.max_unavailable.as_ref())
    {
        Some(value) => scaled_value(value, desired, true).unwrap_or(desired),
        None => 1,
    };
    status.number_ready >= desired - max_unavailable
}

/// Ready once the pods above the partition run the update revision
///
/// Revisions only converge when nothing is held back by a partition.
pub fn stateful_set_ready(sts: &StatefulSet) -> bool {
    let observed = sts
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    if observed < sts.metadata.generation.unwrap_or(0) {
        return false;
    }

    let spec = sts.spec.as_ref();
    let strategy = spec.and_then(|s| s.update_strategy.as_ref());
    if !is_rolling_update(strategy.and_then(|s| s.type_.as_deref())) {
        return true;
    }

    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let partition = strategy
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0);
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
    let expected = replicas - partition;

    if status.updated_replicas.unwrap_or(0) < expected {
        return false;
    }
    if status.ready_replicas.unwrap_or(0) < expected {
        return false;
    }
    if partition == 0 && status.current_revision != status.update_revision {
        return false;
    }
    true
}

pub fn service_ready(svc: &Service) -> bool {
    let Some(spec) = svc.spec.as_ref() else {
        return false;
    };
    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");
    if service_type == "ExternalName" {
        return true;
    }
    if spec.cluster_ip.as_deref().unwrap_or_default().is_empty() {
        return false;
    }
    if service_type == "LoadBalancer" {
        if spec.external_ips.as_ref().is_some_and(|ips| !ips.is_empty()) {
            return true;
        }
        return svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .is_some_and(|ingress| !ingress.is_empty());
    }
    true
}

pub fn volume_ready(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Bound")
}

/// Established, or stuck on a name conflict that waiting will not fix
pub fn crd_ready(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                (c.type_ == "Established" && c.status == "True")
                    || (c.type_ == "NamesAccepted" && c.status == "False")
            })
        })
}
