//! Error taxonomy and retry-policy types for the branch lifecycle domain.
//!
//! [`ControllerError`] is the single error type returned across component
//! boundaries (ingestion, resolution chain, lifecycle handlers). Each variant
//! maps onto exactly one [`ErrorKind`], which carries the machine-readable
//! reason reported to callers and decides the [`RetryPolicy`].
//!
//! Adapter-level errors ([`crate::ports::SecretError`],
//! [`crate::ports::MetadataError`], [`crate::ports::BackendError`],
//! [`crate::ports::BusError`]) are defined beside their ports and converted
//! here explicitly, never through a catch-all.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BranchName, BranchNameError, EventKind, LifecycleState};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// The controller itself never retries; the policy tells an operator or an
/// external supervisor whether re-issuing the event can help.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means the
        /// caller applies its own schedule.
        after: Option<Duration>,
    },
    /// Retrying without operator intervention cannot succeed.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Category of a [`ControllerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad webhook signature, or a rejected / missing API credential.
    AuthenticationFailure,
    /// Malformed payload or invalid branch name.
    ValidationFailure,
    /// Repository, profile or stack absent when expected present.
    NotFound,
    /// The remote API refused the request because of request quotas.
    RateLimited,
    /// The requested transition cannot be applied to the observed state.
    Conflict,
    /// Network failure or timeout.
    Transient,
    /// Unclassified backend failure.
    Fatal,
}

impl ErrorKind {
    /// Machine-readable reason code reported to callers.
    pub fn reason_code(self) -> &'static str {
        match self {
            Self::AuthenticationFailure => "authentication_failure",
            Self::ValidationFailure => "validation_failure",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason_code())
    }
}

/// Errors crossing component boundaries.
///
/// Messages never contain secret values. Each variant names the
/// [`ErrorKind`] it belongs to.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControllerError {
    /// [`ErrorKind::AuthenticationFailure`].
    #[error("authentication failed: {reason}")]
    Authentication {
        /// Non-sensitive description of what was rejected.
        reason: String,
    },

    /// [`ErrorKind::ValidationFailure`] caused by a branch name.
    #[error("invalid branch name: {0}")]
    InvalidBranchName(#[from] BranchNameError),

    /// [`ErrorKind::ValidationFailure`] caused by payload content.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// What was wrong with the payload.
        reason: String,
    },

    /// [`ErrorKind::NotFound`].
    #[error("{resource} not found")]
    NotFound {
        /// The missing resource (e.g. `"repository octo/widgets"`).
        resource: String,
    },

    /// [`ErrorKind::RateLimited`].
    #[error("rate limited: {guidance}")]
    RateLimited {
        /// Operator guidance (e.g. configure an API token).
        guidance: String,
        /// Earliest time a retry can succeed, if the provider reported it.
        retry_after: Option<Duration>,
    },

    /// [`ErrorKind::Conflict`].
    #[error("cannot apply {requested} event to branch '{branch}' while it is {observed}")]
    Conflict {
        /// Branch the event applied to.
        branch: BranchName,
        /// State reported by the backend.
        observed: LifecycleState,
        /// Transition that was requested.
        requested: EventKind,
    },

    /// [`ErrorKind::Transient`].
    #[error("{operation} failed transiently: {message}")]
    Transient {
        /// Operation that failed (e.g. `"create_stack"`).
        operation: String,
        /// Non-sensitive failure description.
        message: String,
    },

    /// [`ErrorKind::Fatal`].
    #[error("{operation} failed: {message}")]
    Fatal {
        /// Operation that failed.
        operation: String,
        /// Non-sensitive failure description.
        message: String,
    },
}

impl ControllerError {
    /// Returns the taxonomy category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::AuthenticationFailure,
            Self::InvalidBranchName(_) | Self::InvalidPayload { .. } => {
                ErrorKind::ValidationFailure
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Machine-readable reason code (see [`ErrorKind::reason_code`]).
    pub fn reason_code(&self) -> &'static str {
        self.kind().reason_code()
    }

    /// Whether re-issuing the failed operation can succeed.
    ///
    /// Authentication and validation failures are never retried
    /// automatically.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Transient { .. } | Self::Conflict { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            Self::Authentication { .. }
            | Self::InvalidBranchName(_)
            | Self::InvalidPayload { .. }
            | Self::NotFound { .. }
            | Self::Fatal { .. } => RetryPolicy::NonRetryable,
        }
    }

    /// Shorthand for a [`ControllerError::Transient`].
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`ControllerError::Fatal`].
    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
