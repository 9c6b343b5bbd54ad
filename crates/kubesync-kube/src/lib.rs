//! kubesync kube - reconciling manifests against a Kubernetes cluster
//!
//! This crate provides:
//! - **Resource Client**: build, create, update, delete and inspect resources from YAML manifests
//! - **Patch Strategies**: strategic merge, three-way JSON merge and server-side apply
//! - **Readiness Checks**: per-kind readiness rules for Deployments, StatefulSets, Jobs and more
//! - **Wait Strategies**: watch-based, polling and hook-only waiters behind one trait
//! - **Annotations**: Helm-compatible resource policy and hook annotations
//!
//! Every call against the API server goes through [`ClusterApi`], so the same
//! code runs against a live cluster ([`KubeCluster`]) or in memory ([`MockCluster`]).

pub mod annotations;
pub mod client;
pub mod cluster;
pub mod error;
pub mod field_manager;
pub mod kinds;
pub mod options;
pub mod patch;
pub mod ready;
pub mod resource;
pub mod retry;
pub mod wait;

pub use client::{RELATED_SUFFIX, ResourceClient};
pub use cluster::{
    ClusterApi, Delay, Failure, KubeCluster, MockCluster, OperationCounts, PatchDocument, Verb,
};
pub use error::{KubeError, Result};
pub use field_manager::resolve_field_manager;
pub use kinds::{BuiltinKind, is_custom_group};
pub use options::{
    ClientConfig, CreateOptions, FieldValidation, UpdateOptions, UpdateStrategy, WaitOptions,
    WaitStrategy,
};
pub use patch::{ComputedPatch, PatchType, create_patch};
pub use ready::{ReadyChecker, ReadyCheckerConfig};
pub use resource::{ObjectKey, ReconcileResult, ResourceInfo, ResourceList, RestMapping};
pub use retry::{Backoff, KeyedLocks, retry_on_conflict};
pub use wait::{HookOnlyWaiter, LegacyWaiter, Status, StatusWaiter, Waiter};
