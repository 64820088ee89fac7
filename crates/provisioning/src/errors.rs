//! Error and retry-policy types for webhook provisioning.
//!
//! [`ProvisionError`] is the single classified error returned by one
//! reconciliation attempt. The worker loop owns retry decisions; it reads them
//! from [`ProvisionError::retry_policy`] rather than matching on variants.
//!
//! [`StoreError`] and [`QueueError`] are the error types of the external
//! collaborators reached through [`crate::ports`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ExternalServiceId, ExternalServiceKind, JobId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: transient store failures, code-host 5xx, rate limits,
///   network failures, cancellation.
/// - `NonRetryable` errors: unsupported service kind, deleted service,
///   malformed config, bad credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt, e.g. derived from a
        /// `Retry-After` header. `None` means apply the caller's own schedule.
        after: Option<Duration>,
    },
    /// Requeueing will not fix this; the job must be failed permanently.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Provisioning errors
// ---------------------------------------------------------------------------

/// Stable classification of a [`ProvisionError`], persisted on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotSupported,
    ConfigUnavailable,
    NotFound,
    Malformed,
    RemoteUnavailable,
    Unauthorized,
    Rejected,
    AlreadyExists,
    Cancelled,
}

impl ErrorKind {
    /// Label used in metrics and structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::ConfigUnavailable => "config_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Malformed => "malformed",
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Rejected => "rejected",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while provisioning a webhook for one job.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The external service's kind cannot carry webhooks, or the stored kind
    /// no longer matches the job.
    #[error("external service kind '{kind}' does not support webhooks: {reason}")]
    NotSupported {
        kind: ExternalServiceKind,
        reason: String,
    },

    /// The external-service store could not be read right now.
    #[error("external service {id} config unavailable: {message}")]
    ConfigUnavailable {
        id: ExternalServiceId,
        message: String,
    },

    /// The external service was deleted between enqueue and processing.
    #[error("external service {id} not found")]
    NotFound { id: ExternalServiceId },

    /// The stored connection document does not parse or is structurally invalid.
    #[error("external service {id} config is malformed: {message}")]
    Malformed {
        id: ExternalServiceId,
        message: String,
    },

    /// Network failure, 5xx, or rate limit on the code host.
    #[error("code host unavailable{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    RemoteUnavailable {
        status: Option<u16>,
        message: String,
        /// Delay the code host asked for before the next request.
        retry_after: Option<Duration>,
    },

    /// The code host rejected the credentials (or hides the hooks API from them).
    #[error("code host rejected credentials (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// The code host rejected the request for a reason retrying cannot fix.
    #[error("code host rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// A webhook with the same target already exists remotely.
    #[error("webhook already exists: {message}")]
    AlreadyExists { message: String },

    /// The attempt was cancelled at a remote-call boundary.
    #[error("cancelled while {stage}")]
    Cancelled { stage: &'static str },
}

impl ProvisionError {
    /// Returns the stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::NotSupported { .. } => ErrorKind::NotSupported,
            ProvisionError::ConfigUnavailable { .. } => ErrorKind::ConfigUnavailable,
            ProvisionError::NotFound { .. } => ErrorKind::NotFound,
            ProvisionError::Malformed { .. } => ErrorKind::Malformed,
            ProvisionError::RemoteUnavailable { .. } => ErrorKind::RemoteUnavailable,
            ProvisionError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ProvisionError::Rejected { .. } => ErrorKind::Rejected,
            ProvisionError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ProvisionError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns whether the worker loop may requeue the job.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            ProvisionError::ConfigUnavailable { .. } | ProvisionError::Cancelled { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            ProvisionError::RemoteUnavailable { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            ProvisionError::NotSupported { .. }
            | ProvisionError::NotFound { .. }
            | ProvisionError::Malformed { .. }
            | ProvisionError::Unauthorized { .. }
            | ProvisionError::Rejected { .. }
            | ProvisionError::AlreadyExists { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Errors from the external-service store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("external service {0} not found")]
    NotFound(ExternalServiceId),

    #[error("external service store unavailable: {0}")]
    Unavailable(String),

    #[error("external service {0} was modified concurrently")]
    Conflict(ExternalServiceId),
}

/// Errors from the job queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} does not exist")]
    UnknownJob(JobId),

    /// The caller's lease expired and another worker may have claimed the job.
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseMismatch(JobId),

    #[error("job queue unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_are_not_retryable() {
        let errors = [
            ProvisionError::NotFound {
                id: ExternalServiceId::new(1),
            },
            ProvisionError::Malformed {
                id: ExternalServiceId::new(1),
                message: "missing secret".into(),
            },
            ProvisionError::Unauthorized {
                status: 401,
                message: "Bad credentials".into(),
            },
            ProvisionError::NotSupported {
                kind: ExternalServiceKind::GitLab,
                reason: "no client".into(),
            },
        ];
        for err in errors {
            assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable, "{err}");
        }
    }

    #[test]
    fn remote_unavailable_carries_retry_after() {
        let err = ProvisionError::RemoteUnavailable {
            status: Some(429),
            message: "rate limited".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(err.to_string(), "code host unavailable (HTTP 429): rate limited");
    }

    #[test]
    fn cancellation_is_retryable() {
        let err = ProvisionError::Cancelled {
            stage: "creating webhook",
        };
        assert!(err.retry_policy().is_retryable());
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
