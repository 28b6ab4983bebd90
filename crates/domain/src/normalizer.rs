//! Maps provider webhook payloads onto the canonical [`BranchEvent`].
//!
//! Two provider shapes describe the same logical event:
//!
//! | Transport event | Shape | Branch lifecycle signal |
//! |-----------------|-------|-------------------------|
//! | `create` / `delete` | [`RefEventPayload`] | `ref_type == "branch"`, short ref name |
//! | `push` | [`PushEventPayload`] | `created` / `deleted` flags on a `refs/heads/*` ref |
//!
//! Both are parsed into the tagged union [`RawEvent`] and resolved exactly
//! once here. Anything that is not a branch lifecycle signal produces
//! [`Normalized::Ignored`]; payloads that claim to be one but cannot be read
//! produce a [`NormalizeError`]. Callers must be able to tell the two apart.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    BranchEvent, BranchName, BranchNameError, ControllerError, DeliveryId, EventKind,
    RepositoryId, Timestamp,
};

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

// ---------------------------------------------------------------------------
// Provider payload shapes
// ---------------------------------------------------------------------------

/// Repository block shared by every payload shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    /// `owner/name`.
    pub full_name: String,
}

/// Account that triggered the event.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderPayload {
    /// Account login.
    pub login: String,
}

/// Explicit ref creation / deletion notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RefEventPayload {
    /// Short ref name (no `refs/heads/` prefix).
    #[serde(rename = "ref")]
    pub reference: String,
    /// `"branch"` or `"tag"`.
    pub ref_type: String,
    /// Originating repository.
    pub repository: RepositoryPayload,
    /// Triggering account.
    #[serde(default)]
    pub sender: Option<SenderPayload>,
}

/// Push notification; branch lifecycle is signalled by side-effect flags.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEventPayload {
    /// Fully qualified ref (`refs/heads/...` or `refs/tags/...`).
    #[serde(rename = "ref")]
    pub reference: String,
    /// The push created the ref.
    #[serde(default)]
    pub created: bool,
    /// The push deleted the ref.
    #[serde(default)]
    pub deleted: bool,
    /// Originating repository.
    pub repository: RepositoryPayload,
    /// Triggering account.
    #[serde(default)]
    pub sender: Option<SenderPayload>,
}

/// A provider payload, discriminated by the transport's event-type header.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// `create` or `delete`.
    BranchRef {
        /// Whether the ref was created or deleted.
        kind: EventKind,
        /// Parsed body.
        payload: RefEventPayload,
    },
    /// `push`.
    Push(PushEventPayload),
    /// `ping`, sent once when the webhook is configured.
    Ping,
    /// Any other event class; the body is not parsed.
    Unsupported(String),
}

impl RawEvent {
    /// Parses `body` according to `event_type`.
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self, NormalizeError> {
        let malformed = |e: serde_json::Error| NormalizeError::Malformed {
            event_type: event_type.to_string(),
            message: e.to_string(),
        };

        match event_type {
            "create" | "delete" => {
                let kind = if event_type == "create" {
                    EventKind::Created
                } else {
                    EventKind::Deleted
                };
                let payload = serde_json::from_slice(body).map_err(malformed)?;
                Ok(Self::BranchRef { kind, payload })
            }
            "push" => Ok(Self::Push(serde_json::from_slice(body).map_err(malformed)?)),
            "ping" => Ok(Self::Ping),
            other => Ok(Self::Unsupported(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why an authenticated payload produced no event. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event class carries no branch lifecycle signal.
    UnsupportedEventType(String),
    /// Webhook configuration ping.
    Ping,
    /// A tag was created, deleted or pushed.
    TagRef(String),
    /// Some other non-branch ref.
    NonBranchRef(String),
    /// A push that neither created nor deleted its branch.
    NoLifecycleChange,
    /// The event belongs to a different repository.
    ForeignRepository(String),
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedEventType(t) => write!(f, "event type '{t}' is not handled"),
            Self::Ping => f.write_str("ping"),
            Self::TagRef(r) => write!(f, "tag ref '{r}'"),
            Self::NonBranchRef(r) => write!(f, "non-branch ref '{r}'"),
            Self::NoLifecycleChange => f.write_str("push did not create or delete a branch"),
            Self::ForeignRepository(r) => write!(f, "repository '{r}' is not the bound repository"),
        }
    }
}

/// Outcome of normalising one authenticated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// A canonical event to route.
    Event(BranchEvent),
    /// Intentionally dropped.
    Ignored(IgnoreReason),
}

/// A payload that claims to be a branch lifecycle event but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// Required fields are missing or the body is not JSON.
    #[error("malformed '{event_type}' payload: {message}")]
    Malformed {
        /// Transport event type.
        event_type: String,
        /// Parser message.
        message: String,
    },

    /// The branch name violates pipeline naming constraints.
    #[error("branch '{branch}' cannot back a pipeline: {source}")]
    InvalidBranchName {
        /// The rejected name, verbatim.
        branch: String,
        /// Which constraint failed.
        source: BranchNameError,
    },

    /// A push payload set both `created` and `deleted`.
    #[error("push to '{reference}' sets both created and deleted")]
    AmbiguousPush {
        /// The pushed ref.
        reference: String,
    },
}

impl From<NormalizeError> for ControllerError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::InvalidBranchName { source, .. } => {
                ControllerError::InvalidBranchName(source)
            }
            other => ControllerError::InvalidPayload {
                reason: other.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Converts authenticated payloads for one bound repository.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    repository: RepositoryId,
}

impl EventNormalizer {
    /// Creates a normalizer that accepts events for `repository` only.
    pub fn new(repository: RepositoryId) -> Self {
        Self { repository }
    }

    /// The repository this normalizer is bound to.
    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    /// Normalises one payload.
    ///
    /// `event_type` is the transport's discriminator (`X-GitHub-Event`).
    pub fn normalize(
        &self,
        event_type: &str,
        body: &[u8],
        delivery_id: Option<DeliveryId>,
        received_at: Timestamp,
    ) -> Result<Normalized, NormalizeError> {
        let raw = RawEvent::parse(event_type, body)?;

        let (kind, branch, sender) = match raw {
            RawEvent::Ping => return Ok(Normalized::Ignored(IgnoreReason::Ping)),
            RawEvent::Unsupported(t) => {
                debug!(event_type = %t, "Ignoring unsupported event type");
                return Ok(Normalized::Ignored(IgnoreReason::UnsupportedEventType(t)));
            }
            RawEvent::BranchRef { kind, payload } => {
                if let Some(ignored) = self.foreign(&payload.repository) {
                    return Ok(ignored);
                }
                match payload.ref_type.as_str() {
                    "branch" => {}
                    "tag" => {
                        return Ok(Normalized::Ignored(IgnoreReason::TagRef(payload.reference)))
                    }
                    _ => {
                        return Ok(Normalized::Ignored(IgnoreReason::NonBranchRef(
                            payload.reference,
                        )))
                    }
                }
                (kind, payload.reference, payload.sender)
            }
            RawEvent::Push(payload) => {
                if let Some(ignored) = self.foreign(&payload.repository) {
                    return Ok(ignored);
                }
                let short = match payload.reference.strip_prefix(BRANCH_REF_PREFIX) {
                    Some(short) => short.to_string(),
                    None if payload.reference.starts_with(TAG_REF_PREFIX) => {
                        return Ok(Normalized::Ignored(IgnoreReason::TagRef(payload.reference)))
                    }
                    None => {
                        return Ok(Normalized::Ignored(IgnoreReason::NonBranchRef(
                            payload.reference,
                        )))
                    }
                };
                let kind = match (payload.created, payload.deleted) {
                    (true, true) => {
                        return Err(NormalizeError::AmbiguousPush {
                            reference: payload.reference,
                        })
                    }
                    (true, false) => EventKind::Created,
                    (false, true) => EventKind::Deleted,
                    (false, false) => {
                        return Ok(Normalized::Ignored(IgnoreReason::NoLifecycleChange))
                    }
                };
                (kind, short, payload.sender)
            }
        };

        let branch_name = BranchName::parse(branch.clone())
            .map_err(|source| NormalizeError::InvalidBranchName { branch, source })?;

        Ok(Normalized::Event(BranchEvent {
            kind,
            branch_name,
            // The bound identity, so downstream never sees provider casing.
            repository: self.repository.clone(),
            delivery_id,
            sender: sender.map(|s| s.login),
            received_at,
        }))
    }

    fn foreign(&self, repository: &RepositoryPayload) -> Option<Normalized> {
        if self.repository.matches(&repository.full_name) {
            return None;
        }
        warn!(
            expected = %self.repository,
            received = %repository.full_name,
            "Dropping event for a repository this controller is not bound to"
        );
        Some(Normalized::Ignored(IgnoreReason::ForeignRepository(
            repository.full_name.clone(),
        )))
    }
}

#[cfg(test)]
#[path = "normalizer_tests.rs"]
mod tests;
