//! Branchfleet orchestration.
//!
//! Sequences calls between the rules in the [`domain`] crate and the port
//! traits implemented by infrastructure adapters. Contains no I/O of its own
//! beyond timers.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Everything here is expressed against
//! `Arc<dyn Port>` trait objects so the same code drives the in-memory
//! backend in tests and the AWS backend in production.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`lifecycle`] | `LifecycleController`: idempotent provisioning and teardown per branch |
//! | [`locks`] | Per-branch exclusive claims |
//! | [`router`] | `EventRouter`, `InProcessEventBus`, `BusWorker` |
//! | [`queue`] | `QueueWorker`: consumer of a durable event queue |
//! | [`dedup`] | Time-windowed delivery id de-duplication |
//! | [`resolution`] | Branch Resolution Chain |
//! | [`verifier`] | Signature verification against a secret store |
//! | [`secret_cache`] | TTL cache in front of a secret store |

pub mod dedup;
pub mod lifecycle;
pub mod locks;
pub mod queue;
pub mod resolution;
pub mod router;
pub mod secret_cache;
pub mod verifier;

pub use dedup::DeliveryWindow;
pub use lifecycle::{
    CreateBranchHandler, DeleteBranchHandler, LifecycleAction, LifecycleController,
    LifecycleOutcome, LifecycleSettings,
};
pub use locks::{BranchGuard, BranchLocks};
pub use queue::QueueWorker;
pub use resolution::{BranchResolver, BypassFlag, CredentialConfig};
pub use router::{BusSettings, BusWorker, EventRouter, InProcessEventBus};
pub use secret_cache::CachedSecretStore;
pub use verifier::SignatureVerifier;
