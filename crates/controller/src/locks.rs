//! Per-branch exclusive claims.
//!
//! One async mutex per branch name, created on first use and discarded when
//! the last claimant releases it, so the table only holds branches with
//! in-flight work. Distinct branches never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use domain::BranchName;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Table of per-branch locks.
#[derive(Debug, Default)]
pub struct BranchLocks {
    slots: Mutex<HashMap<BranchName, Slot>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the exclusive claim on `branch`.
    ///
    /// Waiters are served in FIFO order.
    pub async fn acquire(&self, branch: &BranchName) -> BranchGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(branch.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        BranchGuard {
            locks: self,
            branch: branch.clone(),
            guard: Some(guard),
        }
    }

    /// Number of branches with a held or awaited claim.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive claim on one branch; released on drop.
#[derive(Debug)]
pub struct BranchGuard<'a> {
    locks: &'a BranchLocks,
    branch: BranchName,
    guard: Option<OwnedMutexGuard<()>>,
}

impl BranchGuard<'_> {
    pub fn branch(&self) -> &BranchName {
        &self.branch
    }
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Release while the table is locked so no new claimant can pick up the
        // slot between the release and the removal check.
        self.guard.take();
        if let Some(slot) = slots.get(&self.branch) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.branch);
            }
        }
    }
}

#[cfg(test)]
#[path = "locks_tests.rs"]
mod tests;
