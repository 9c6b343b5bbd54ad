//! Registry of built-in kinds with known schemas
//!
//! Kinds listed here are served by Kubernetes itself and have a k8s-openapi
//! type. They are type-checked on build and dispatched to kind-specific
//! readiness predicates. Everything else is unstructured.
//!
//! Patch selection works on API groups instead: any kind served by a
//! built-in group takes strategic merge patches, see [`is_custom_group`].

use k8s_openapi::api::{
    apps::v1 as apps, autoscaling::v2 as autoscaling, batch::v1 as batch, core::v1 as core,
    networking::v1 as networking, policy::v1 as policy, rbac::v1 as rbac, storage::v1 as storage,
};
use k8s_openapi::Resource;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextensions;
use kube::core::GroupVersionKind;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{KubeError, Result};

/// API groups served by Kubernetes itself
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "node.k8s.io",
    "scheduling.k8s.io",
];

/// Check if an API group belongs to a custom resource
pub fn is_custom_group(group: &str) -> bool {
    !BUILTIN_GROUPS.contains(&group)
}

/// Closed set of built-in kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    Pod,
    Service,
    ConfigMap,
    Secret,
    Namespace,
    ServiceAccount,
    PersistentVolume,
    PersistentVolumeClaim,
    ReplicationController,
    Endpoints,
    LimitRange,
    ResourceQuota,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Job,
    CronJob,
    Ingress,
    NetworkPolicy,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    StorageClass,
    HorizontalPodAutoscaler,
    PodDisruptionBudget,
    CustomResourceDefinition,
}

impl BuiltinKind {
    /// Look up a kind by group and kind; the version is not significant
    pub fn from_gvk(gvk: &GroupVersionKind) -> Option<Self> {
        Self::from_group_kind(&gvk.group, &gvk.kind)
    }

    pub fn from_group_kind(group: &str, kind: &str) -> Option<Self> {
        let found = match (group, kind) {
            ("", "Pod") => Self::Pod,
            ("", "Service") => Self::Service,
            ("", "ConfigMap") => Self::ConfigMap,
            ("", "Secret") => Self::Secret,
            ("", "Namespace") => Self::Namespace,
            ("", "ServiceAccount") => Self::ServiceAccount,
            ("", "PersistentVolume") => Self::PersistentVolume,
            ("", "PersistentVolumeClaim") => Self::PersistentVolumeClaim,
            ("", "ReplicationController") => Self::ReplicationController,
            ("", "Endpoints") => Self::Endpoints,
            ("", "LimitRange") => Self::LimitRange,
            ("", "ResourceQuota") => Self::ResourceQuota,
            ("apps", "Deployment") => Self::Deployment,
            ("apps", "DaemonSet") => Self::DaemonSet,
            ("apps", "StatefulSet") => Self::StatefulSet,
            ("apps", "ReplicaSet") => Self::ReplicaSet,
            ("batch", "Job") => Self::Job,
            ("batch", "CronJob") => Self::CronJob,
            ("networking.k8s.io", "Ingress") => Self::Ingress,
            ("networking.k8s.io", "NetworkPolicy") => Self::NetworkPolicy,
            ("rbac.authorization.k8s.io", "Role") => Self::Role,
            ("rbac.authorization.k8s.io", "RoleBinding") => Self::RoleBinding,
            ("rbac.authorization.k8s.io", "ClusterRole") => Self::ClusterRole,
            ("rbac.authorization.k8s.io", "ClusterRoleBinding") => Self::ClusterRoleBinding,
            ("storage.k8s.io", "StorageClass") => Self::StorageClass,
            ("autoscaling", "HorizontalPodAutoscaler") => Self::HorizontalPodAutoscaler,
            ("policy", "PodDisruptionBudget") => Self::PodDisruptionBudget,
            ("apiextensions.k8s.io", "CustomResourceDefinition") => Self::CustomResourceDefinition,
            _ => return None,
        };
        Some(found)
    }

    /// Workloads whose pods are reported as related objects
    pub fn owns_pods(self) -> bool {
        matches!(
            self,
            Self::Deployment
                | Self::DaemonSet
                | Self::StatefulSet
                | Self::ReplicaSet
                | Self::ReplicationController
                | Self::Job
        )
    }

    /// Equality label selector for the pods of a workload
    ///
    /// `data` is the object body without metadata. Returns `None` for kinds
    /// that own no pods and for empty selectors, which would match everything.
    pub fn pod_selector(self, data: &Value) -> Option<String> {
        if !self.owns_pods() {
            return None;
        }
        let selector = data.get("spec")?.get("selector")?;
        let labels = match self {
            // replication controllers use a bare label map
            Self::ReplicationController => selector,
            _ => selector.get("matchLabels")?,
        };
        let terms: Vec<String> = labels
            .as_object()?
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|value| format!("{key}={value}")))
            .collect();
        (!terms.is_empty()).then(|| terms.join(","))
    }

    /// Type-check an object against its schema
    pub fn validate(self, object: &Value) -> Result<()> {
        match self {
            Self::Pod => check::<core::Pod>(object),
            Self::Service => check::<core::Service>(object),
            Self::ConfigMap => check::<core::ConfigMap>(object),
            Self::Secret => check::<core::Secret>(object),
            Self::Namespace => check::<core::Namespace>(object),
            Self::ServiceAccount => check::<core::ServiceAccount>(object),
            Self::PersistentVolume => check::<core::PersistentVolume>(object),
            Self::PersistentVolumeClaim => check::<core::PersistentVolumeClaim>(object),
            Self::ReplicationController => check::<core::ReplicationController>(object),
            Self::Endpoints => check::<core::Endpoints>(object),
            Self::LimitRange => check::<core::LimitRange>(object),
            Self::ResourceQuota => check::<core::ResourceQuota>(object),
            Self::Deployment => check::<apps::Deployment>(object),
            Self::DaemonSet => check::<apps::DaemonSet>(object),
            Self::StatefulSet => check::<apps::StatefulSet>(object),
            Self::ReplicaSet => check::<apps::ReplicaSet>(object),
            Self::Job => check::<batch::Job>(object),
            Self::CronJob => check::<batch::CronJob>(object),
            Self::Ingress => check::<networking::Ingress>(object),
            Self::NetworkPolicy => check::<networking::NetworkPolicy>(object),
            Self::Role => check::<rbac::Role>(object),
            Self::RoleBinding => check::<rbac::RoleBinding>(object),
            Self::ClusterRole => check::<rbac::ClusterRole>(object),
            Self::ClusterRoleBinding => check::<rbac::ClusterRoleBinding>(object),
            Self::StorageClass => check::<storage::StorageClass>(object),
            Self::HorizontalPodAutoscaler => {
                check::<autoscaling::HorizontalPodAutoscaler>(object)
            }
            Self::PodDisruptionBudget => check::<policy::PodDisruptionBudget>(object),
            Self::CustomResourceDefinition => {
                check::<apiextensions::CustomResourceDefinition>(object)
            }
        }
    }
}

fn check<T: Resource + DeserializeOwned>(object: &Value) -> Result<()> {
    decode::<T>(object)
        .map(|_| ())
        .map_err(|e| KubeError::InvalidManifest(e.to_string()))
}

/// Decode a dynamic payload into its typed form
///
/// The typed schema is pinned to one version, so the payload's apiVersion is
/// rewritten to it first; older served versions of these kinds decode through
/// their common fields.
pub fn decode<T: Resource + DeserializeOwned>(object: &Value) -> Result<T> {
    let mut object = object.clone();
    if let Some(map) = object.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            Value::String(T::API_VERSION.to_string()),
        );
    }
    Ok(serde_json::from_value(object)?)
}
