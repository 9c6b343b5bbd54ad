//! Options for the resource client and the waiters
//!
//! All option structs deserialize from camelCase YAML/JSON with defaults for
//! every field, so partial configuration documents are accepted.

use std::time::Duration;

use kube::api::{PatchParams, PostParams, ValidationDirective};
use serde::{Deserialize, Serialize};

use crate::error::{KubeError, Result};
use crate::retry::Backoff;

/// Server-side schema validation of written objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldValidation {
    /// Drop unknown or duplicate fields silently
    Ignore,
    /// Accept the object but report unknown or duplicate fields
    Warn,
    /// Reject objects with unknown or duplicate fields
    #[default]
    Strict,
}

impl FieldValidation {
    pub fn directive(self) -> ValidationDirective {
        match self {
            FieldValidation::Ignore => ValidationDirective::Ignore,
            FieldValidation::Warn => ValidationDirective::Warn,
            FieldValidation::Strict => ValidationDirective::Strict,
        }
    }
}

/// How [`ResourceClient::create`](crate::ResourceClient::create) writes objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    /// Create through a server-side apply patch instead of a POST
    pub server_side_apply: bool,
    /// Take ownership of fields managed by other field managers
    pub force_conflicts: bool,
    pub dry_run: bool,
    pub field_validation: FieldValidation,
}

impl CreateOptions {
    pub fn validate(&self) -> Result<()> {
        if self.force_conflicts && !self.server_side_apply {
            return Err(KubeError::InvalidConfig(
                "force conflicts requires server-side apply".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            server_side_apply: self.server_side_apply,
            force_conflicts: self.force_conflicts,
            dry_run: self.dry_run,
            field_validation: self.field_validation,
            ..Default::default()
        }
    }
}

/// How [`ResourceClient::update`](crate::ResourceClient::update) writes objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateOptions {
    /// Use a three-way JSON merge patch for custom resources
    pub three_way_merge_for_unstructured: bool,
    /// Send the full target as a server-side apply patch
    pub server_side_apply: bool,
    /// Take ownership of fields managed by other field managers
    pub force_conflicts: bool,
    /// Replace live objects with a PUT instead of patching them
    pub force_replace: bool,
    pub dry_run: bool,
    pub field_validation: FieldValidation,
}

/// Write path chosen for objects that already exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    Replace,
    ServerSideApply { force: bool },
    ClientSidePatch { three_way_unstructured: bool },
}

impl UpdateOptions {
    /// Reject contradictory combinations before anything is sent
    pub fn validate(&self) -> Result<()> {
        if self.three_way_merge_for_unstructured && self.server_side_apply {
            return Err(KubeError::InvalidConfig(
                "three-way merge for unstructured objects cannot be combined with server-side apply"
                    .to_string(),
            ));
        }
        if self.force_conflicts && self.force_replace {
            return Err(KubeError::InvalidConfig(
                "force conflicts cannot be combined with force replace".to_string(),
            ));
        }
        if self.server_side_apply && self.force_replace {
            return Err(KubeError::InvalidConfig(
                "server-side apply cannot be combined with force replace".to_string(),
            ));
        }
        if self.force_conflicts && !self.server_side_apply {
            return Err(KubeError::InvalidConfig(
                "force conflicts requires server-side apply".to_string(),
            ));
        }
        Ok(())
    }

    pub fn strategy(&self) -> UpdateStrategy {
        if self.force_replace {
            UpdateStrategy::Replace
        } else if self.server_side_apply {
            UpdateStrategy::ServerSideApply {
                force: self.force_conflicts,
            }
        } else {
            UpdateStrategy::ClientSidePatch {
                three_way_unstructured: self.three_way_merge_for_unstructured,
            }
        }
    }

    pub(crate) fn create_options(&self) -> CreateOptions {
        CreateOptions {
            server_side_apply: self.server_side_apply,
            force_conflicts: self.force_conflicts,
            dry_run: self.dry_run,
            field_validation: self.field_validation,
        }
    }

    pub(crate) fn patch_params(&self, field_manager: &str) -> PatchParams {
        PatchParams {
            dry_run: self.dry_run,
            force: self.server_side_apply && self.force_conflicts,
            field_manager: Some(field_manager.to_string()),
            field_validation: Some(self.field_validation.directive()),
            ..Default::default()
        }
    }

    pub(crate) fn post_params(&self, field_manager: &str) -> PostParams {
        PostParams {
            dry_run: self.dry_run,
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        }
    }
}

/// Which waiter [`ResourceClient::waiter`](crate::ResourceClient::waiter) builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitStrategy {
    /// Follow object status through watches
    #[default]
    Watcher,
    /// Poll the readiness checker at a fixed interval
    Legacy,
    /// Only wait for hook Pods and Jobs
    HookOnly,
}

impl std::str::FromStr for WaitStrategy {
    type Err = KubeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "watcher" => Ok(WaitStrategy::Watcher),
            "legacy" => Ok(WaitStrategy::Legacy),
            "hookOnly" | "hookonly" | "hook-only" => Ok(WaitStrategy::HookOnly),
            other => Err(KubeError::InvalidConfig(format!(
                "unknown wait strategy {other:?}; expected watcher, legacy or hookOnly"
            ))),
        }
    }
}

/// Tuning shared by the waiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    /// Delay between two polls of the legacy waiter
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Consecutive transient errors tolerated per object
    #[serde(default = "default_max_transient_errors")]
    pub max_transient_errors: u32,

    /// Treat paused Deployments as ready
    #[serde(default)]
    pub paused_as_ready: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_transient_errors: default_max_transient_errors(),
            paused_as_ready: false,
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_transient_errors() -> u32 {
    30
}

/// Settings of a [`ResourceClient`](crate::ResourceClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Namespace given to namespaced objects that declare none
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Field manager attached to every write; derived from the binary when unset
    #[serde(default)]
    pub field_manager: Option<String>,

    /// Retry schedule for writes that lose a resourceVersion race
    #[serde(default)]
    pub conflict_backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            field_manager: None,
            conflict_backoff: Backoff::default(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_option_conflicts() {
        let cases = [
            UpdateOptions {
                three_way_merge_for_unstructured: true,
                server_side_apply: true,
                ..Default::default()
            },
            UpdateOptions {
                server_side_apply: true,
                force_conflicts: true,
                force_replace: true,
                ..Default::default()
            },
            UpdateOptions {
                server_side_apply: true,
                force_replace: true,
                ..Default::default()
            },
        ];
        for options in cases {
            assert!(
                matches!(options.validate(), Err(KubeError::InvalidConfig(_))),
                "{options:?}"
            );
        }

        UpdateOptions::default().validate().unwrap();
        UpdateOptions {
            force_replace: true,
            ..Default::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            UpdateOptions::default().strategy(),
            UpdateStrategy::ClientSidePatch {
                three_way_unstructured: false
            }
        );
        let ssa = UpdateOptions {
            server_side_apply: true,
            force_conflicts: true,
            ..Default::default()
        };
        assert_eq!(ssa.strategy(), UpdateStrategy::ServerSideApply { force: true });
        assert!(ssa.patch_params("kubesync").force);

        let replace = UpdateOptions {
            force_replace: true,
            ..Default::default()
        };
        assert_eq!(replace.strategy(), UpdateStrategy::Replace);
    }

    #[test]
    fn test_create_force_requires_apply() {
        let options = CreateOptions {
            force_conflicts: true,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_wait_strategy_parse() {
        assert_eq!("watcher".parse::<WaitStrategy>().unwrap(), WaitStrategy::Watcher);
        assert_eq!("legacy".parse::<WaitStrategy>().unwrap(), WaitStrategy::Legacy);
        assert_eq!("hookOnly".parse::<WaitStrategy>().unwrap(), WaitStrategy::HookOnly);
        assert!("eventual".parse::<WaitStrategy>().is_err());

        let from_yaml: WaitStrategy = serde_yaml::from_str("hookOnly").unwrap();
        assert_eq!(from_yaml, WaitStrategy::HookOnly);
    }

    #[test]
    fn test_config_defaults_from_partial_yaml() {
        let wait: WaitOptions = serde_yaml::from_str("pollInterval: 500ms\n").unwrap();
        assert_eq!(wait.poll_interval, Duration::from_millis(500));
        assert_eq!(wait.max_transient_errors, 30);

        let client: ClientConfig = serde_yaml::from_str("fieldManager: ci\n").unwrap();
        assert_eq!(client.namespace, "default");
        assert_eq!(client.field_manager.as_deref(), Some("ci"));
        assert_eq!(client.conflict_backoff, Backoff::default());

        let update: UpdateOptions =
            serde_yaml::from_str("serverSideApply: true\nfieldValidation: warn\n").unwrap();
        assert!(update.server_side_apply);
        assert_eq!(update.field_validation, FieldValidation::Warn);
    }
}
