//! Conflict retries with exponential backoff
//!
//! Single-object writes that lose an optimistic concurrency race (409
//! Conflict) are retried a bounded number of times. Concurrent writers of the
//! same identity inside one client are serialized with [`KeyedLocks`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::Result;
use crate::resource::ObjectKey;

/// Exponential backoff schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Maximum number of attempts
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every attempt
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Random extra delay, as a fraction of the delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_steps() -> u32 {
    4
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_factor() -> f64 {
    5.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            initial_delay: default_initial_delay(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::from_secs_f64(self.initial_delay.as_secs_f64() * self.factor.powi(exponent))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        delay + Duration::from_secs_f64(delay.as_secs_f64() * extra)
    }
}

/// Run `operation`, retrying while it fails with a conflict
///
/// Returns the last error once the schedule is exhausted. Errors other than
/// conflicts are returned immediately.
pub async fn retry_on_conflict<F, Fut, T>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt + 1 < steps => {
                let delay = backoff.jittered(attempt);
                debug!(
                    operation = %operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One async mutex per object identity
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`; released when the guard drops
    pub async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // forget identities nobody holds or waits for
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
