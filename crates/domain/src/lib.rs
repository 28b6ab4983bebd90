//! Core branch lifecycle domain for Branchfleet.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and cross-cutting error type used by the controller. Infrastructure
//! crates implement the port traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`BranchName`, `RepositoryId`, `SecretName`, etc.) |
//! | [`types`] | `BranchEvent`, `LifecycleState`, `BranchPipelineResource`, `ResolutionResult` |
//! | [`errors`] | Error taxonomy and retry policy |
//! | [`ports`] | Traits for secret store, metadata API, pipeline service, build jobs, event bus |
//! | [`normalizer`] | Provider payload shapes → canonical `BranchEvent` |
//! | [`signature`] | HMAC-SHA256 webhook signatures |

pub mod errors;
pub mod identifiers;
pub mod normalizer;
pub mod ports;
pub mod signature;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{ControllerError, ErrorKind, RetryPolicy};
pub use identifiers::{
    BranchName, BranchNameError, BuildJobRef, DeliveryId, RepositoryId, RepositoryIdError,
    SecretName, StackHandle, TemplateRef, TraceId, MAX_BRANCH_NAME_LEN,
};
pub use normalizer::{EventNormalizer, IgnoreReason, NormalizeError, Normalized, RawEvent};
pub use ports::{
    BackendError, BranchEventHandler, BuildJobService, BusError, EventBus, EventQueue,
    MetadataError, QueuedEvent, RepositoryMetadata, SecretError, SecretStore, StackService,
};
pub use signature::SignatureError;
pub use types::{
    BranchEvent, BranchPipelineResource, EventKind, LifecycleState, ResolutionResult,
    ResolutionSource, Timestamp,
};

// Secret values cross every port; re-exported so adapters share one type.
pub use secrecy::{ExposeSecret, SecretString};
