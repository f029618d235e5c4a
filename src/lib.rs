use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Conflict writing {0}: the object has been modified, retrying against the latest revision")]
    Conflict(String),

    #[error("The object {0} does not exist")]
    ObjectNotFound(String),

    #[error("The object {0} already exists")]
    AlreadyExists(String),

    #[error("The object {0} has no name")]
    MissingName(String),

    #[error("Cleanup of {identity} is not yet complete: {message}")]
    CleanupPending {
        identity: String,
        message: String,
    },

    #[error("Failed to reach external resource: {0}")]
    External(String),

    #[error("Invalid controller configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Leadership was lost, stopping the controller")]
    LeadershipLost,

    #[error("Reconciler task failed: {0}")]
    ReconcilerPanicked(String),

    #[error("Metrics Error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Conflict(_) => "Conflict",
            Error::ObjectNotFound(_) => "ObjectNotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::MissingName(_) => "MissingName",
            Error::CleanupPending { .. } => "CleanupPending",
            Error::External(_) => "External",
            Error::InvalidConfiguration(_) => "InvalidConfiguration",
            Error::LeadershipLost => "LeadershipLost",
            Error::ReconcilerPanicked(_) => "ReconcilerPanicked",
            Error::MetricsError(_) => "MetricsError",
        }
    }

    /// Optimistic concurrency failures, retried immediately rather than with backoff
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

pub mod controllers;

/// The generic reconciliation engine: queue, workers, finalizers
pub mod runtime;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::{Diagnostics, State};
pub use metrics::Metrics;

/// Custom resources
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code,
        }))
    }

    #[test]
    fn http_409_is_a_conflict() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
    }

    #[test]
    fn cleanup_pending_is_not_a_conflict() {
        let err = Error::CleanupPending {
            identity: "default/a".into(),
            message: "1 replica remaining".into(),
        };
        assert!(!err.is_conflict());
        assert_eq!(err.metric_label(), "CleanupPending");
    }

    #[test]
    fn already_exists_is_not_a_conflict() {
        let err = Error::AlreadyExists("default/a".into());
        assert!(!err.is_conflict());
        assert_eq!(err.metric_label(), "AlreadyExists");
    }
}
