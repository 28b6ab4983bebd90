//! Shared value types for the branch lifecycle domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types
//! describe units of work and observed state: the canonical [`BranchEvent`],
//! the per-branch [`BranchPipelineResource`], and the bootstrap
//! [`ResolutionResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BranchName, BuildJobRef, DeliveryId, RepositoryId};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which lifecycle transition a [`BranchEvent`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A branch was created in the source repository.
    Created,
    /// A branch was deleted from the source repository.
    Deleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// Canonical unit of work produced by the normalizer.
///
/// Transient: built per request, handed to the event bus, never persisted.
/// Handlers downstream of the normalizer only ever see this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEvent {
    /// Requested transition.
    pub kind: EventKind,

    /// Branch the event applies to. Already validated against naming rules.
    pub branch_name: BranchName,

    /// Repository the event originated from.
    pub repository: RepositoryId,

    /// Provider delivery id, when the transport supplied one.
    ///
    /// `None` degrades de-duplication to controller-level idempotence.
    pub delivery_id: Option<DeliveryId>,

    /// Login of the account that triggered the event, for diagnostics.
    pub sender: Option<String>,

    /// When the ingestion endpoint received the event.
    ///
    /// Diagnostic only; event ordering is never derived from it.
    pub received_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of one branch pipeline, as reported by the backend.
///
/// ```text
/// Absent ──▶ Provisioning ──▶ Active ──▶ Destroying ──▶ Absent
///                 │                          │
///                 └────────▶ Failed ◀────────┘
/// ```
///
/// `Failed` is left only through an operator-triggered (or redelivered)
/// event, which re-enters `Provisioning` or `Destroying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No pipeline exists for the branch.
    Absent,
    /// A create request was accepted and has not settled.
    Provisioning,
    /// The pipeline stack exists and is usable.
    Active,
    /// A destroy request was accepted and has not settled.
    Destroying,
    /// The last create or destroy did not complete.
    Failed,
}

impl LifecycleState {
    /// Returns `true` while a backend operation is still running.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Provisioning | Self::Destroying)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The per-branch deployable unit.
///
/// This is a view assembled from the backend registry on demand; the
/// controller never keeps its own long-lived copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPipelineResource {
    /// Identity key, unique across the fleet.
    pub branch_name: BranchName,

    /// State as reported by the managed pipeline service.
    pub lifecycle_state: LifecycleState,

    /// Build job producing the branch's artifact, if one exists.
    pub build_job_ref: Option<BuildJobRef>,
}

// ---------------------------------------------------------------------------
// Branch resolution
// ---------------------------------------------------------------------------

/// Where a [`ResolutionResult`] branch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionSource {
    /// Reported by the remote repository metadata API.
    RemoteAPI,
    /// The configured fallback, used because validation was bypassed.
    Fallback,
}

/// Outcome of the bootstrap branch resolution chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    /// Branch the primary pipeline deploys from.
    pub branch: BranchName,

    /// Which step of the chain produced `branch`.
    pub source: ResolutionSource,

    /// Ordered, human-readable notes on degraded steps
    /// (e.g. `"validation skipped"`).
    pub warnings: Vec<String>,
}

impl ResolutionResult {
    /// Returns `true` if `branch` is the resolved primary branch.
    ///
    /// Only the primary pipeline carries production stages.
    pub fn is_primary(&self, branch: &BranchName) -> bool {
        &self.branch == branch
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
