//! Port traits for every external collaborator.
//!
//! Infrastructure crates implement these; the controller depends only on the
//! traits. Each port has its own error type whose variants mirror the
//! distinctions the collaborator can actually report, so callers classify
//! failures explicitly into [`ControllerError`].
//!
//! | Port | Implemented by |
//! |------|----------------|
//! | [`SecretStore`] | `backend` (environment, in-memory, Secrets Manager) |
//! | [`RepositoryMetadata`] | `github` |
//! | [`StackService`] / [`BuildJobService`] | `backend` (in-memory, AWS CLI) |
//! | [`EventBus`] | `controller` (in-process bus, development only) |
//! | [`EventQueue`] | `backend` (SQS over the AWS CLI) |
//! | [`BranchEventHandler`] | `controller` (lifecycle handlers) |

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

use crate::{
    BranchEvent, BranchName, BuildJobRef, ControllerError, LifecycleState, RepositoryId,
    SecretName, StackHandle, TemplateRef,
};

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

/// Failure to read a secret. Never carries the secret value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// No secret with this name exists.
    #[error("secret '{name}' not found")]
    NotFound {
        /// Name that was looked up.
        name: SecretName,
    },

    /// The secret exists but the caller may not read it.
    #[error("access to secret '{name}' denied")]
    AccessDenied {
        /// Name that was looked up.
        name: SecretName,
    },

    /// The store could not be reached.
    #[error("secret store unavailable while reading '{name}': {message}")]
    Unavailable {
        /// Name that was looked up.
        name: SecretName,
        /// Non-sensitive failure description.
        message: String,
    },
}

/// Key-value lookup of string secrets (webhook secret, API token).
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the secret stored under `name`.
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError>;
}

// ---------------------------------------------------------------------------
// Remote repository metadata
// ---------------------------------------------------------------------------

/// Failure categories of the remote repository metadata API.
///
/// The categories are disjoint; the resolution chain reacts differently to
/// each.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// Credentials were rejected, or are required and were not supplied.
    #[error("request unauthorized (HTTP {status}): {message}")]
    Unauthorized {
        /// HTTP status code (401 or 403).
        status: u16,
        /// Provider message.
        message: String,
    },

    /// The request quota is exhausted.
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        /// When the quota resets, if reported.
        retry_after: Option<Duration>,
        /// Provider message.
        message: String,
    },

    /// The repository does not exist or is not visible to the caller.
    #[error("repository not found")]
    NotFound,

    /// Network failure, timeout or server-side error.
    #[error("transient failure: {message}")]
    Transient {
        /// Failure description.
        message: String,
    },

    /// Any other response.
    #[error("unexpected response: {message}")]
    Other {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Failure description.
        message: String,
    },
}

/// Reads repository metadata from the source-control provider.
#[async_trait]
pub trait RepositoryMetadata: Send + Sync {
    /// Returns the repository's default branch as reported by the provider.
    ///
    /// Requests are anonymous when `token` is `None`.
    async fn default_branch(
        &self,
        repository: &RepositoryId,
        token: Option<&SecretString>,
    ) -> Result<String, MetadataError>;
}

// ---------------------------------------------------------------------------
// Managed pipeline service and build jobs
// ---------------------------------------------------------------------------

/// Failures reported by the managed pipeline service or build job service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The resource already exists.
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Resource description.
        resource: String,
    },

    /// The resource does not exist.
    #[error("{resource} does not exist")]
    NotFound {
        /// Resource description.
        resource: String,
    },

    /// The resource is mid-operation and the request cannot be applied.
    #[error("conflicting operation in progress: {message}")]
    Conflict {
        /// Backend message.
        message: String,
    },

    /// The call did not complete within its time bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The bound that elapsed.
        after: Duration,
    },

    /// Network failure or throttling.
    #[error("transient backend failure: {message}")]
    Transient {
        /// Backend message.
        message: String,
    },

    /// Unclassified failure.
    #[error("backend failure: {message}")]
    Fatal {
        /// Backend message.
        message: String,
    },
}

impl BackendError {
    /// Converts into the boundary taxonomy for `operation`.
    ///
    /// `AlreadyExists` and `NotFound` are normally absorbed by the caller as
    /// idempotent success before reaching this point.
    pub fn into_controller_error(self, operation: &str) -> ControllerError {
        match self {
            Self::NotFound { resource } => ControllerError::NotFound { resource },
            Self::Timeout { .. } | Self::Transient { .. } => {
                ControllerError::transient(operation, self.to_string())
            }
            Self::AlreadyExists { .. } | Self::Conflict { .. } | Self::Fatal { .. } => {
                ControllerError::fatal(operation, self.to_string())
            }
        }
    }
}

/// The managed pipeline service that materialises per-branch stacks.
///
/// Implementations are idempotent: creating an existing stack and destroying
/// an absent one both succeed. The service's registry is the source of truth
/// for [`LifecycleState`].
#[async_trait]
pub trait StackService: Send + Sync {
    /// Requests materialisation of `branch`'s stack from `template`.
    ///
    /// Returns once the request is accepted; completion is observed through
    /// [`StackService::stack_state`].
    async fn create_stack(
        &self,
        branch: &BranchName,
        template: &TemplateRef,
    ) -> Result<StackHandle, BackendError>;

    /// Requests teardown of `branch`'s stack.
    async fn destroy_stack(&self, branch: &BranchName) -> Result<(), BackendError>;

    /// Returns the current state of `branch`'s stack.
    async fn stack_state(&self, branch: &BranchName) -> Result<LifecycleState, BackendError>;
}

/// The externally managed build job that produces a branch's artifact.
#[async_trait]
pub trait BuildJobService: Send + Sync {
    /// Creates the build job for `branch`, or returns the existing one.
    async fn ensure_job(&self, branch: &BranchName) -> Result<BuildJobRef, BackendError>;

    /// Returns the build job for `branch`, if one exists.
    async fn find_job(&self, branch: &BranchName) -> Result<Option<BuildJobRef>, BackendError>;

    /// Deletes the build job and any durable artifacts stored for `branch`.
    async fn delete_job(&self, branch: &BranchName) -> Result<(), BackendError>;
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Failure to hand an event to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus has shut down and accepts no more events.
    #[error("event bus is closed")]
    Closed,

    /// No handler is subscribed for the event's kind.
    #[error("no handler subscribed for '{kind}' events")]
    NoSubscriber {
        /// The unrouted event kind.
        kind: crate::EventKind,
    },

    /// The queue service could not be reached or refused the call.
    #[error("event queue unavailable: {message}")]
    Unavailable {
        /// Non-sensitive failure description.
        message: String,
    },
}

/// Accepts canonical events for asynchronous dispatch.
///
/// `publish` returns once the event is durably handed over, not once a
/// handler has run. Delivery is at-least-once with no ordering guarantee
/// across events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hands `event` to the bus.
    async fn publish(&self, event: BranchEvent) -> Result<(), BusError>;
}

/// An event taken from an [`EventQueue`], invisible to other consumers until
/// acknowledged or until its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Opaque handle passed back to [`EventQueue::acknowledge`].
    pub receipt: String,
    /// The queued event.
    pub event: BranchEvent,
    /// How many times the queue has handed this event out, this delivery
    /// included. Starts at 1.
    pub receive_count: u32,
}

/// An [`EventBus`] whose events survive a process restart.
///
/// `publish` returns only after the queue service has stored the event. An
/// event that is received but never acknowledged is delivered again.
#[async_trait]
pub trait EventQueue: EventBus {
    /// Waits for up to one batch of events. An empty batch is not an error.
    async fn receive(&self) -> Result<Vec<QueuedEvent>, BusError>;

    /// Removes a handled event from the queue.
    async fn acknowledge(&self, receipt: &str) -> Result<(), BusError>;
}

/// Handles one kind of [`BranchEvent`]. Must be safely re-entrant.
#[async_trait]
pub trait BranchEventHandler: Send + Sync {
    /// Applies `event`.
    async fn handle(&self, event: &BranchEvent) -> Result<(), ControllerError>;
}
