//! Branchfleet webhook ingestion.
//!
//! Receives GitHub webhook deliveries over HTTP, authenticates and normalises
//! them, and hands the resulting [`domain::BranchEvent`] to an
//! [`domain::EventBus`]. The response is sent as soon as the bus accepts the
//! event; lifecycle work happens afterwards.
//!
//! | Outcome | Status | `status` field |
//! |---------|--------|----------------|
//! | Event queued | 200 | `accepted` |
//! | Authenticated but not a branch lifecycle event | 200 | `ignored` |
//! | Signature missing or wrong, secret unreadable | 401 | `unauthorized` |
//! | Payload unparseable or branch name invalid | 400 | `rejected` |
//! | Bus refused the event | 500 | `error` |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP framing lives here; the [`domain`] crate sees
//! only raw bytes and the event-type string.

pub mod server;
pub mod webhook;

pub use server::{router, serve, ListenerSettings};
pub use webhook::{WebhookReceiver, WebhookResponse};
