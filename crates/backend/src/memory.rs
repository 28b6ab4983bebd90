//! In-memory implementation of the stack and build job ports.
//!
//! Models the managed pipeline service closely enough to exercise the
//! controller: creation and teardown are accepted immediately and settle
//! after a configurable number of state reads. Every call is recorded, and
//! failures can be injected per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    BackendError, BranchName, BuildJobRef, BuildJobService, LifecycleState, StackHandle,
    StackService, TemplateRef,
};
use tracing::debug;

/// Backend operation, used for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateStack,
    DestroyStack,
    StackState,
    EnsureJob,
    FindJob,
    DeleteJob,
}

impl Operation {
    /// Whether the operation changes backend state.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::StackState | Self::FindJob)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub operation: Operation,
    pub branch: BranchName,
}

#[derive(Debug)]
struct StackEntry {
    state: LifecycleState,
    target: LifecycleState,
    pending_polls: u32,
    handle: StackHandle,
}

#[derive(Debug, Default)]
struct Inner {
    stacks: HashMap<BranchName, StackEntry>,
    jobs: HashMap<BranchName, BuildJobRef>,
    calls: Vec<BackendCall>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    fail_next_settle: bool,
    in_flight: HashMap<BranchName, usize>,
    max_in_flight: usize,
    builds_started: u64,
}

/// In-memory [`StackService`] and [`BuildJobService`].
#[derive(Debug)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    latency: Duration,
    settle_polls: u32,
    job_prefix: String,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a backend whose operations settle immediately.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency: Duration::ZERO,
            settle_polls: 0,
            job_prefix: "branchfleet".to_string(),
        }
    }

    /// Adds `latency` to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Keeps stacks in a transitional state for `polls` state reads after
    /// creation or teardown is accepted.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Prefix used for build job names.
    pub fn with_job_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_prefix = prefix.into();
        self
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Places `branch`'s stack in a settled `state`.
    pub fn seed(&self, branch: &BranchName, state: LifecycleState) {
        self.seed_settling(branch, state, state, 0);
    }

    /// Places `branch`'s stack in `state`, settling into `target` after
    /// `polls` state reads.
    pub fn seed_settling(
        &self,
        branch: &BranchName,
        state: LifecycleState,
        target: LifecycleState,
        polls: u32,
    ) {
        let mut inner = self.lock();
        if state == LifecycleState::Absent {
            inner.stacks.remove(branch);
            return;
        }
        let Ok(handle) = stack_handle(branch, 0) else {
            return;
        };
        inner.stacks.insert(
            branch.clone(),
            StackEntry {
                state,
                target,
                pending_polls: polls,
                handle,
            },
        );
    }

    /// Registers a build job for `branch`.
    pub fn seed_job(&self, branch: &BranchName) {
        if let Ok(job) = self.job_name(branch) {
            self.lock().jobs.insert(branch.clone(), job);
        }
    }

    /// Makes the next call to `operation` fail with `error`.
    ///
    /// Injected failures queue up per operation.
    pub fn fail_next(&self, operation: Operation, error: BackendError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Makes the next accepted creation or teardown settle into
    /// [`LifecycleState::Failed`].
    pub fn fail_next_settle(&self) {
        self.lock().fail_next_settle = true;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Number of calls to `operation` for `branch`.
    pub fn call_count(&self, operation: Operation, branch: &BranchName) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && &c.branch == branch)
            .count()
    }

    /// Number of state-changing calls for `branch`.
    pub fn mutation_count(&self, branch: &BranchName) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation.is_mutation() && &c.branch == branch)
            .count()
    }

    /// Current state of `branch`'s stack, without recording a call or
    /// advancing settlement.
    pub fn peek_state(&self, branch: &BranchName) -> LifecycleState {
        self.lock()
            .stacks
            .get(branch)
            .map_or(LifecycleState::Absent, |e| e.state)
    }

    /// Whether a build job exists for `branch`.
    pub fn has_job(&self, branch: &BranchName) -> bool {
        self.lock().jobs.contains_key(branch)
    }

    /// Highest number of state-changing calls observed in flight at once for
    /// a single branch.
    pub fn max_concurrent_mutations(&self) -> usize {
        self.lock().max_in_flight
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_name(&self, branch: &BranchName) -> Result<BuildJobRef, BackendError> {
        build_job_ref(&self.job_prefix, branch)
    }

    /// Records the call, applies injected failures and latency.
    async fn begin(
        &self,
        operation: Operation,
        branch: &BranchName,
    ) -> Result<InFlight<'_>, BackendError> {
        let tracked = {
            let mut inner = self.lock();
            inner.calls.push(BackendCall {
                operation,
                branch: branch.clone(),
            });
            if let Some(err) = inner
                .failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
            {
                debug!(?operation, branch = %branch, error = %err, "Injected backend failure");
                return Err(err);
            }
            if operation.is_mutation() {
                let count = inner.in_flight.entry(branch.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                inner.max_in_flight = inner.max_in_flight.max(count);
                Some(branch.clone())
            } else {
                None
            }
        };
        let guard = InFlight {
            backend: self,
            branch: tracked,
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(guard)
    }

    fn take_settle_outcome(inner: &mut Inner, success: LifecycleState) -> LifecycleState {
        if std::mem::take(&mut inner.fail_next_settle) {
            LifecycleState::Failed
        } else {
            success
        }
    }

    fn initial_state(&self, transitional: LifecycleState, target: LifecycleState) -> LifecycleState {
        if self.settle_polls == 0 {
            target
        } else {
            transitional
        }
    }
}

/// Decrements the in-flight counter for a mutation when dropped.
struct InFlight<'a> {
    backend: &'a InMemoryBackend,
    branch: Option<BranchName>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(branch) = self.branch.take() {
            let mut inner = self.backend.lock();
            if let Some(count) = inner.in_flight.get_mut(&branch) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.in_flight.remove(&branch);
                }
            }
        }
    }
}

fn stack_handle(branch: &BranchName, build: u64) -> Result<StackHandle, BackendError> {
    StackHandle::new(format!("{branch}:{build}")).ok_or_else(|| BackendError::Fatal {
        message: "empty stack handle".to_string(),
    })
}

fn build_job_ref(prefix: &str, branch: &BranchName) -> Result<BuildJobRef, BackendError> {
    BuildJobRef::new(format!("{prefix}-{branch}-create")).ok_or_else(|| BackendError::Fatal {
        message: "empty build job name".to_string(),
    })
}

#[async_trait]
impl StackService for InMemoryBackend {
    async fn create_stack(
        &self,
        branch: &BranchName,
        template: &TemplateRef,
    ) -> Result<StackHandle, BackendError> {
        let _guard = self.begin(Operation::CreateStack, branch).await?;
        let mut inner = self.lock();

        if let Some(entry) = inner.stacks.get(branch) {
            match entry.state {
                LifecycleState::Active | LifecycleState::Provisioning => {
                    return Ok(entry.handle.clone());
                }
                LifecycleState::Destroying => {
                    return Err(BackendError::Conflict {
                        message: format!("stack for '{branch}' is being destroyed"),
                    });
                }
                LifecycleState::Absent | LifecycleState::Failed => {}
            }
        }

        inner.builds_started += 1;
        let handle = stack_handle(branch, inner.builds_started)?;
        let target = Self::take_settle_outcome(&mut inner, LifecycleState::Active);
        let state = self.initial_state(LifecycleState::Provisioning, target);
        debug!(branch = %branch, template = %template, %handle, "Stack creation accepted");

        inner.stacks.insert(
            branch.clone(),
            StackEntry {
                state,
                target,
                pending_polls: self.settle_polls,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    async fn destroy_stack(&self, branch: &BranchName) -> Result<(), BackendError> {
        let _guard = self.begin(Operation::DestroyStack, branch).await?;
        let mut inner = self.lock();

        let current = inner.stacks.get(branch).map(|e| e.state);
        match current {
            None | Some(LifecycleState::Absent) | Some(LifecycleState::Destroying) => Ok(()),
            Some(LifecycleState::Provisioning) => Err(BackendError::Conflict {
                message: format!("stack for '{branch}' is being provisioned"),
            }),
            Some(LifecycleState::Active) | Some(LifecycleState::Failed) => {
                let target = Self::take_settle_outcome(&mut inner, LifecycleState::Absent);
                let state = self.initial_state(LifecycleState::Destroying, target);
                if state == LifecycleState::Absent {
                    inner.stacks.remove(branch);
                } else if let Some(entry) = inner.stacks.get_mut(branch) {
                    entry.state = state;
                    entry.target = target;
                    entry.pending_polls = self.settle_polls;
                }
                debug!(branch = %branch, "Stack teardown accepted");
                Ok(())
            }
        }
    }

    async fn stack_state(&self, branch: &BranchName) -> Result<LifecycleState, BackendError> {
        let _guard = self.begin(Operation::StackState, branch).await?;
        let mut inner = self.lock();

        let Some(entry) = inner.stacks.get_mut(branch) else {
            return Ok(LifecycleState::Absent);
        };
        if entry.pending_polls > 0 {
            entry.pending_polls -= 1;
            return Ok(entry.state);
        }
        entry.state = entry.target;
        let state = entry.state;
        if state == LifecycleState::Absent {
            inner.stacks.remove(branch);
        }
        Ok(state)
    }
}

#[async_trait]
impl BuildJobService for InMemoryBackend {
    async fn ensure_job(&self, branch: &BranchName) -> Result<BuildJobRef, BackendError> {
        let _guard = self.begin(Operation::EnsureJob, branch).await?;
        let job = self.job_name(branch)?;
        let mut inner = self.lock();
        let job = inner.jobs.entry(branch.clone()).or_insert(job).clone();
        Ok(job)
    }

    async fn find_job(&self, branch: &BranchName) -> Result<Option<BuildJobRef>, BackendError> {
        let _guard = self.begin(Operation::FindJob, branch).await?;
        let inner = self.lock();
        Ok(inner.jobs.get(branch).cloned())
    }

    async fn delete_job(&self, branch: &BranchName) -> Result<(), BackendError> {
        let _guard = self.begin(Operation::DeleteJob, branch).await?;
        let mut inner = self.lock();
        match inner.jobs.remove(branch) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound {
                resource: format!("build job for '{branch}'"),
            }),
        }
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
