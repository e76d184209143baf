//! Error taxonomy for the model watcher.
//!
//! Each variant maps to one recovery policy: config and submission errors are
//! retried on the next tick without advancing the marker, execution failures
//! are terminal for their task, and restart errors are retried with backoff.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The watched `ConfigMap` could not be read (platform unreachable or object missing).
    #[error("Failed to read watched config {name}: {message}")]
    ConfigRead { name: String, message: String },

    /// The watched `ConfigMap` exists but its data does not describe a valid run.
    #[error("Invalid watched config: {0}")]
    InvalidConfig(String),

    #[error("Task submission failed: {0}")]
    TaskSubmission(#[from] SubmissionError),

    /// The regeneration worker exited non-zero.
    #[error("Regeneration task {name} failed: {message}")]
    TaskExecution { name: String, message: String },

    #[error("Restart of {service} failed after {attempts} attempt(s): {message}")]
    RestartTrigger {
        service: String,
        attempts: u32,
        message: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lease error: {0}")]
    Lease(String),
}

/// Reasons a task creation call was refused.
#[derive(Error, Debug)]
pub enum SubmissionError {
    /// A job with the derived name already exists.
    #[error("job {0} already exists")]
    NameCollision(String),

    /// Quota, admission or transient API fault.
    #[error("job {name} rejected: {reason}")]
    Rejected { name: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short machine-readable kind used in logs and the status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigRead { .. } | Self::InvalidConfig(_) => "config-read",
            Self::TaskSubmission(_) => "task-submission",
            Self::TaskExecution { .. } => "task-execution",
            Self::RestartTrigger { .. } => "restart-trigger",
            Self::Timeout { .. } => "timeout",
            Self::Kube(_) => "kube",
            Self::Serialization(_) => "serialization",
            Self::Lease(_) => "lease",
        }
    }
}

/// Returns true when the error is a Kubernetes API response with the given HTTP code.
pub(crate) fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_group_config_failures() {
        let missing = Error::ConfigRead {
            name: "ml-config".to_string(),
            message: "not found".to_string(),
        };
        let invalid = Error::InvalidConfig("DATASET_NAME is empty".to_string());
        assert_eq!(missing.kind(), "config-read");
        assert_eq!(invalid.kind(), "config-read");
    }

    #[test]
    fn runtime_failures_have_their_own_kinds() {
        let timeout = Error::Timeout {
            operation: "create task",
            timeout: Duration::from_secs(10),
        };
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(timeout.to_string(), "create task timed out after 10s");

        let serialization: Error = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert_eq!(serialization.kind(), "serialization");
        assert_eq!(Error::Lease("held".to_string()).kind(), "lease");
    }

    #[test]
    fn submission_errors_convert() {
        let err: Error = SubmissionError::NameCollision("job-ds1-1".to_string()).into();
        assert_eq!(err.kind(), "task-submission");
        assert_eq!(
            err.to_string(),
            "Task submission failed: job job-ds1-1 already exists"
        );
    }
}
