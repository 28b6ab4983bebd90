//! Lifecycle Controller.
//!
//! Per-branch state machine:
//!
//! ```text
//! Absent ──create──▶ Provisioning ──▶ Active ──delete──▶ Destroying ──▶ Absent
//!                         │                                   │
//!                         └──────────────▶ Failed ◀───────────┘
//! ```
//!
//! The backend's registry is the only record of [`LifecycleState`]; every
//! decision starts from a fresh `stack_state` read taken under the branch's
//! exclusive claim. Handlers are re-entrant: a duplicate create on an
//! `Active` branch and a delete on an `Absent` one are no-ops, and a
//! re-issued event recovers a `Failed` branch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    BackendError, BranchEvent, BranchEventHandler, BranchName, BranchPipelineResource,
    BuildJobService, ControllerError, EventKind, LifecycleState, StackService, TemplateRef,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::locks::BranchLocks;

/// Timing and template settings for [`LifecycleController`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Template the managed pipeline service materialises per branch.
    pub template: TemplateRef,
    /// Upper bound on each individual backend call.
    pub call_timeout: Duration,
    /// Delay between state reads while waiting for a stack to settle.
    pub settle_poll_interval: Duration,
    /// Upper bound on waiting for a stack to settle.
    pub settle_timeout: Duration,
}

impl LifecycleSettings {
    pub fn new(template: TemplateRef) -> Self {
        Self {
            template,
            call_timeout: Duration::from_secs(60),
            settle_poll_interval: Duration::from_secs(15),
            settle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// What a handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// The stack was provisioned.
    Provisioned,
    /// The stack and its build job were torn down.
    Destroyed,
    /// Nothing needed doing.
    NoOp,
}

/// Result of one lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleOutcome {
    /// The branch's resource after the operation.
    pub resource: BranchPipelineResource,
    pub action: LifecycleAction,
}

/// Drives per-branch provisioning and teardown.
pub struct LifecycleController {
    stacks: Arc<dyn StackService>,
    jobs: Arc<dyn BuildJobService>,
    settings: LifecycleSettings,
    locks: BranchLocks,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    pub fn new(
        stacks: Arc<dyn StackService>,
        jobs: Arc<dyn BuildJobService>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            stacks,
            jobs,
            settings,
            locks: BranchLocks::new(),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Handles a branch creation for a raw branch name.
    ///
    /// The name is validated before any backend call.
    pub async fn on_branch_created(&self, branch: &str) -> Result<LifecycleOutcome, ControllerError> {
        let branch = BranchName::parse(branch)?;
        self.provision(&branch).await
    }

    /// Handles a branch deletion for a raw branch name.
    ///
    /// The name is validated before any backend call.
    pub async fn on_branch_deleted(&self, branch: &str) -> Result<LifecycleOutcome, ControllerError> {
        let branch = BranchName::parse(branch)?;
        self.teardown(&branch).await
    }

    /// Reports the branch's resource as the backend sees it.
    pub async fn describe(&self, branch: &str) -> Result<BranchPipelineResource, ControllerError> {
        let branch = BranchName::parse(branch)?;
        let state = self.read_state(&branch).await?;
        let job = self.find_job(&branch).await?;
        Ok(resource(&branch, state, job))
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Brings `branch` to `Active`.
    #[instrument(skip_all, fields(branch = %branch))]
    pub async fn provision(&self, branch: &BranchName) -> Result<LifecycleOutcome, ControllerError> {
        let _claim = self.locks.acquire(branch).await;

        let mut state = self.read_state(branch).await?;
        if state == LifecycleState::Destroying {
            info!("Waiting for in-flight teardown to settle before provisioning");
            state = self.settle_foreign(branch, EventKind::Created).await?;
        }

        match state {
            LifecycleState::Active | LifecycleState::Provisioning => {
                debug!(%state, "Branch pipeline already present; nothing to do");
                let job = self.find_job(branch).await?;
                return Ok(LifecycleOutcome {
                    resource: resource(branch, state, job),
                    action: LifecycleAction::NoOp,
                });
            }
            LifecycleState::Failed => info!("Retrying provisioning of failed branch pipeline"),
            LifecycleState::Absent | LifecycleState::Destroying => {}
        }

        info!("Provisioning branch pipeline");
        let job = self
            .bounded("ensure_job", self.jobs.ensure_job(branch))
            .await
            .map_err(|e| self.failed(branch, "ensure_job", e))?;

        match self
            .bounded(
                "create_stack",
                self.stacks.create_stack(branch, &self.settings.template),
            )
            .await
        {
            Ok(handle) => debug!(%handle, "Stack creation accepted"),
            Err(BackendError::AlreadyExists { .. }) => debug!("Stack already exists"),
            Err(e) => return Err(self.failed(branch, "create_stack", e)),
        }

        let settled = self
            .wait_until(branch, stale_failure(state), |s| {
                matches!(s, LifecycleState::Active | LifecycleState::Failed)
            })
            .await
            .map_err(|e| self.log_failed(branch, e))?;

        if settled == LifecycleState::Failed {
            return Err(self.log_failed(
                branch,
                ControllerError::fatal(
                    "create_stack",
                    format!("stack for '{branch}' settled in state failed"),
                ),
            ));
        }

        info!(job = %job, "Branch pipeline active");
        Ok(LifecycleOutcome {
            resource: resource(branch, LifecycleState::Active, Some(job)),
            action: LifecycleAction::Provisioned,
        })
    }

    // -----------------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------------

    /// Brings `branch` to `Absent`.
    #[instrument(skip_all, fields(branch = %branch))]
    pub async fn teardown(&self, branch: &BranchName) -> Result<LifecycleOutcome, ControllerError> {
        let _claim = self.locks.acquire(branch).await;

        let mut state = self.read_state(branch).await?;
        if state == LifecycleState::Provisioning {
            info!("Waiting for in-flight provisioning to settle before teardown");
            state = self.settle_foreign(branch, EventKind::Deleted).await?;
        }

        if state == LifecycleState::Absent {
            // A stack removed out of band can leave its build job behind.
            return match self.find_job(branch).await? {
                None => {
                    debug!("Branch pipeline already absent; nothing to do");
                    Ok(LifecycleOutcome {
                        resource: resource(branch, LifecycleState::Absent, None),
                        action: LifecycleAction::NoOp,
                    })
                }
                Some(job) => {
                    warn!(job = %job, "Stack absent but build job remains; removing it");
                    self.delete_job(branch).await?;
                    Ok(LifecycleOutcome {
                        resource: resource(branch, LifecycleState::Absent, None),
                        action: LifecycleAction::Destroyed,
                    })
                }
            };
        }

        info!(%state, "Tearing down branch pipeline");
        match self
            .bounded("destroy_stack", self.stacks.destroy_stack(branch))
            .await
        {
            Ok(()) => debug!("Stack teardown accepted"),
            Err(BackendError::NotFound { .. }) => debug!("Stack already deleted"),
            Err(e) => return Err(self.failed(branch, "destroy_stack", e)),
        }

        // The build job goes only once the stack request has been accepted.
        self.delete_job(branch).await?;

        let settled = self
            .wait_until(branch, stale_failure(state), |s| {
                matches!(s, LifecycleState::Absent | LifecycleState::Failed)
            })
            .await
            .map_err(|e| self.log_failed(branch, e))?;

        if settled == LifecycleState::Failed {
            return Err(self.log_failed(
                branch,
                ControllerError::fatal(
                    "destroy_stack",
                    format!("stack for '{branch}' settled in state failed"),
                ),
            ));
        }

        info!("Branch pipeline removed");
        Ok(LifecycleOutcome {
            resource: resource(branch, LifecycleState::Absent, None),
            action: LifecycleAction::Destroyed,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Runs a backend call under the configured call timeout.
    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let after = self.settings.call_timeout;
        tokio::time::timeout(after, call)
            .await
            .unwrap_or_else(|_| {
                Err(BackendError::Timeout {
                    operation: operation.to_string(),
                    after,
                })
            })
    }

    async fn read_state(&self, branch: &BranchName) -> Result<LifecycleState, ControllerError> {
        self.bounded("stack_state", self.stacks.stack_state(branch))
            .await
            .map_err(|e| e.into_controller_error("stack_state"))
    }

    async fn find_job(
        &self,
        branch: &BranchName,
    ) -> Result<Option<domain::BuildJobRef>, ControllerError> {
        self.bounded("find_job", self.jobs.find_job(branch))
            .await
            .map_err(|e| e.into_controller_error("find_job"))
    }

    async fn delete_job(&self, branch: &BranchName) -> Result<(), ControllerError> {
        match self.bounded("delete_job", self.jobs.delete_job(branch)).await {
            Ok(()) => {
                debug!("Build job removed");
                Ok(())
            }
            Err(BackendError::NotFound { .. }) => {
                debug!("Build job already deleted");
                Ok(())
            }
            Err(e) => Err(self.failed(branch, "delete_job", e)),
        }
    }

    /// Polls until `done` holds for the observed state or the settle timeout
    /// elapses.
    ///
    /// `stale` is the state read before the request was accepted. Backends
    /// that start work asynchronously keep reporting it for a while, so it
    /// only counts as settled once some other state has been observed, or
    /// when it is still reported at the deadline.
    async fn wait_until(
        &self,
        branch: &BranchName,
        stale: Option<LifecycleState>,
        done: impl Fn(LifecycleState) -> bool,
    ) -> Result<LifecycleState, ControllerError> {
        let deadline = Instant::now() + self.settings.settle_timeout;
        let mut stale = stale;
        loop {
            let state = self.read_state(branch).await?;
            if stale.is_some_and(|s| s != state) {
                stale = None;
            }
            let expired = Instant::now() >= deadline;
            if done(state) && (stale.is_none() || expired) {
                return Ok(state);
            }
            if stale.is_some() {
                debug!(%state, "Stack still reports its state from before the request");
            }
            if expired {
                return Err(ControllerError::transient(
                    "settle",
                    format!(
                        "stack for '{branch}' still {state} after {:?}",
                        self.settings.settle_timeout
                    ),
                ));
            }
            debug!(%state, "Waiting for stack to settle");
            tokio::time::sleep(self.settings.settle_poll_interval).await;
        }
    }

    /// Waits out an opposite-kind operation that is already in flight.
    async fn settle_foreign(
        &self,
        branch: &BranchName,
        requested: EventKind,
    ) -> Result<LifecycleState, ControllerError> {
        match self.wait_until(branch, None, |s| !s.is_transitional()).await {
            Ok(state) => Ok(state),
            Err(ControllerError::Transient { .. }) => {
                let observed = self.read_state(branch).await?;
                if !observed.is_transitional() {
                    return Ok(observed);
                }
                warn!(%observed, %requested, "In-flight operation did not settle");
                Err(ControllerError::Conflict {
                    branch: branch.clone(),
                    observed,
                    requested,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn failed(&self, branch: &BranchName, operation: &str, err: BackendError) -> ControllerError {
        self.log_failed(branch, err.into_controller_error(operation))
    }

    fn log_failed(&self, branch: &BranchName, err: ControllerError) -> ControllerError {
        error!(
            branch = %branch,
            reason_code = err.reason_code(),
            error = %err,
            "Branch pipeline transitioned to failed"
        );
        err
    }
}

/// A `Failed` stack keeps reading `Failed` until the retried request
/// reaches the backend.
fn stale_failure(before: LifecycleState) -> Option<LifecycleState> {
    (before == LifecycleState::Failed).then_some(before)
}

fn resource(
    branch: &BranchName,
    state: LifecycleState,
    job: Option<domain::BuildJobRef>,
) -> BranchPipelineResource {
    BranchPipelineResource {
        branch_name: branch.clone(),
        lifecycle_state: state,
        build_job_ref: job,
    }
}

// ---------------------------------------------------------------------------
// Event handlers
// ---------------------------------------------------------------------------

/// Routes [`EventKind::Created`] events to [`LifecycleController::provision`].
#[derive(Debug, Clone)]
pub struct CreateBranchHandler {
    controller: Arc<LifecycleController>,
}

impl CreateBranchHandler {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl BranchEventHandler for CreateBranchHandler {
    async fn handle(&self, event: &BranchEvent) -> Result<(), ControllerError> {
        self.controller.provision(&event.branch_name).await.map(|_| ())
    }
}

/// Routes [`EventKind::Deleted`] events to [`LifecycleController::teardown`].
#[derive(Debug, Clone)]
pub struct DeleteBranchHandler {
    controller: Arc<LifecycleController>,
}

impl DeleteBranchHandler {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl BranchEventHandler for DeleteBranchHandler {
    async fn handle(&self, event: &BranchEvent) -> Result<(), ControllerError> {
        self.controller.teardown(&event.branch_name).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
