//! Waiting for resources to become ready or go away
//!
//! Three strategies share the [`Waiter`] trait:
//!
//! - [`StatusWaiter`] follows every object through a watch and computes a
//!   [`Status`] from each snapshot
//! - [`LegacyWaiter`] polls the [`ReadyChecker`](crate::ReadyChecker) at a
//!   fixed interval
//! - [`HookOnlyWaiter`] only waits for Pods and Jobs annotated as hooks
//!
//! Waits are plain futures bounded by their timeout. Dropping one stops its
//! watches and timers.

mod hook;
mod legacy;
mod status;

pub use hook::HookOnlyWaiter;
pub use legacy::{LegacyWaiter, hook_finished};
pub use status::{Status, StatusWaiter, compute_hook_status, compute_status};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::kinds::BuiltinKind;
use crate::resource::{ResourceInfo, ResourceList};

/// Blocks until resources reach a desired state or the timeout passes
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Wait for every resource to be ready; Jobs are not waited for
    async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<()>;

    /// Like [`Waiter::wait`], also waiting for Jobs to complete
    async fn wait_with_jobs(&self, resources: &ResourceList, timeout: Duration) -> Result<()>;

    /// Wait for hook Pods to succeed and hook Jobs to complete
    async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<()>;

    /// Wait for every resource to be gone from the cluster
    async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<()>;
}

/// Pod or Job, the kinds hooks are waited on
fn hook_kind(info: &ResourceInfo) -> Option<BuiltinKind> {
    BuiltinKind::from_gvk(&info.gvk)
        .filter(|kind| matches!(kind, BuiltinKind::Pod | BuiltinKind::Job))
}
