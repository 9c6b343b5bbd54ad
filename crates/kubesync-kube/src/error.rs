//! Error types for kubesync-kube

use std::time::Duration;

use thiserror::Error;

use crate::resource::ReconcileResult;

/// Result type for kubesync-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during Kubernetes operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Invalid combination of options, detected before any API call
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Manifest document that cannot become a resource
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No REST mapping for the object's type
    #[error("no resource type registered for {api_version}/{kind}")]
    UnknownResourceType { api_version: String, kind: String },

    /// A live object has no baseline in the previously applied set
    #[error("no original object found for {resource}; cannot compute a patch")]
    MissingOriginal { resource: String },

    /// An operation was handed an empty resource list
    #[error("no objects visited")]
    NoObjectsVisited,

    /// The API server rejected the apply patch content type
    #[error("server-side apply is not supported by the server for {resource}: {message}")]
    ServerSideApplyUnsupported { resource: String, message: String },

    /// Field ownership conflict during server-side apply
    #[error("conflict occurred while applying {resource}: {message}")]
    ApplyConflict { resource: String, message: String },

    /// A three-way merge patch would change an immutable identity field
    #[error("patch precondition failed: {field} must not change")]
    PatchPrecondition { field: String },

    /// A Job exhausted its retries
    #[error("job {namespace}/{name} failed: {failed} failed pods exceed backoff limit {backoff_limit}")]
    JobFailed {
        name: String,
        namespace: String,
        failed: i32,
        backoff_limit: i32,
    },

    /// A hook Pod terminated unsuccessfully
    #[error("pod {namespace}/{name} failed")]
    PodFailed { name: String, namespace: String },

    /// Wait deadline reached with objects still pending
    #[error("{}", render_timeout(.not_ready, .timeout))]
    WaitTimeout {
        not_ready: Vec<String>,
        timeout: Duration,
    },

    /// Watch stream failure
    #[error("watch error: {0}")]
    Watch(String),

    /// A worker task panicked or was cancelled
    #[error("task error: {0}")]
    Task(String),

    /// A batch operation failed for some objects
    #[error("{} error(s) occurred ({}):\n{}", .errors.len(), .result.summary(), render_errors(.errors))]
    PartialFailure {
        result: Box<ReconcileResult>,
        errors: Vec<KubeError>,
    },
}

fn render_timeout(not_ready: &[String], timeout: &Duration) -> String {
    let mut lines: Vec<String> = not_ready.to_vec();
    lines.push(format!(
        "context deadline exceeded after {}s",
        timeout.as_secs_f64()
    ));
    lines.join("\n")
}

fn render_errors(errors: &[KubeError]) -> String {
    errors
        .iter()
        .map(|e| format!("  * {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<kubesync_core::CoreError> for KubeError {
    fn from(e: kubesync_core::CoreError) -> Self {
        KubeError::InvalidManifest(e.to_string())
    }
}

impl From<tokio::task::JoinError> for KubeError {
    fn from(e: tokio::task::JoinError) -> Self {
        KubeError::Task(e.to_string())
    }
}

impl KubeError {
    /// Build an API error the way the server reports one
    pub fn api(code: u16, reason: &str, message: impl Into<String>) -> Self {
        KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }))
    }

    /// HTTP status of an API error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Check if this is an optimistic concurrency conflict (409)
    ///
    /// A 409 caused by a name collision on create is not a conflict: retrying
    /// it can never succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp))
            if resp.code == 409 && resp.reason != "AlreadyExists")
    }

    /// Check if the server lacks the requested media type (415)
    pub fn is_unsupported_media_type(&self) -> bool {
        self.status_code() == Some(415)
    }

    /// Errors the poller retries instead of failing the wait
    ///
    /// Covers rate limiting, server side failures other than 501, connection
    /// level errors and etcd unavailability surfaced through any status.
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => {
                resp.code == 0
                    || resp.code == 429
                    || (resp.code >= 500 && resp.code != 501)
                    || resp.message.contains("etcdserver")
            }
            KubeError::Api(_) => true,
            _ => false,
        }
    }

    /// Partial result carried by a batch failure
    pub fn partial_result(&self) -> Option<&ReconcileResult> {
        match self {
            KubeError::PartialFailure { result, .. } => Some(result),
            _ => None,
        }
    }
}
