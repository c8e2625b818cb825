//! Per-target lock table.
//!
//! At most one job may touch a target at a time. Acquisition never waits:
//! a worker that finds the target busy requeues the job and moves on.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{JobId, TargetId};

/// Tracks which job holds each target.
#[derive(Debug, Default)]
pub struct TargetLocks {
    held: DashMap<TargetId, JobId>,
}

impl TargetLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock on `target` for `job`.
    ///
    /// Returns [`OrchestratorError::TargetBusy`] if another job holds it.
    /// The lock is released when the returned guard is dropped.
    pub fn try_acquire(
        self: &Arc<Self>,
        target: &TargetId,
        job: &JobId,
    ) -> OrchestratorResult<TargetGuard> {
        match self.held.entry(target.clone()) {
            Entry::Occupied(entry) => Err(OrchestratorError::TargetBusy {
                target: target.to_string(),
                holder: entry.get().to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
                debug!(target = %target, job_id = %job, "target lock acquired");
                Ok(TargetGuard {
                    locks: Arc::clone(self),
                    target: target.clone(),
                    job: job.clone(),
                })
            }
        }
    }

    /// Mark `target` as held by `job` without handing out a guard.
    ///
    /// Used when restoring a job that was running before a restart; the lock
    /// is freed by [`release`](Self::release) once the job is resolved.
    pub(crate) fn claim(&self, target: &TargetId, job: &JobId) {
        self.held.insert(target.clone(), job.clone());
    }

    /// Release `target` if `job` holds it.
    ///
    /// Returns `true` if the lock was released.
    pub fn release(&self, target: &TargetId, job: &JobId) -> bool {
        let released = self
            .held
            .remove_if(target, |_, holder| holder == job)
            .is_some();
        if released {
            debug!(target = %target, job_id = %job, "target lock released");
        }
        released
    }

    /// Job currently holding `target`.
    #[must_use]
    pub fn holder(&self, target: &TargetId) -> Option<JobId> {
        self.held.get(target).map(|holder| holder.clone())
    }

    /// Number of held targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether no target is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Holds a target lock until dropped.
#[derive(Debug)]
pub struct TargetGuard {
    locks: Arc<TargetLocks>,
    target: TargetId,
    job: JobId,
}

impl TargetGuard {
    /// The locked target.
    #[must_use]
    pub const fn target(&self) -> &TargetId {
        &self.target
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.locks.release(&self.target, &self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() {
        let locks = Arc::new(TargetLocks::new());
        let target = TargetId::new("app-1");
        let first = JobId::generate();
        let second = JobId::generate();

        let guard = locks.try_acquire(&target, &first).expect("acquire");
        assert_eq!(guard.target(), &target);

        match locks.try_acquire(&target, &second) {
            Err(OrchestratorError::TargetBusy { holder, .. }) => {
                assert_eq!(holder, first.to_string());
            }
            other => panic!("expected TargetBusy, got {other:?}"),
        }

        drop(guard);
        assert!(locks.is_empty());
        let _guard = locks.try_acquire(&target, &second).expect("free again");
        assert_eq!(locks.holder(&target), Some(second));
    }

    #[test]
    fn different_targets_are_independent() {
        let locks = Arc::new(TargetLocks::new());
        let _a = locks
            .try_acquire(&TargetId::new("app-1"), &JobId::generate())
            .expect("app-1");
        let _b = locks
            .try_acquire(&TargetId::new("app-2"), &JobId::generate())
            .expect("app-2");
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn release_ignores_other_holders() {
        let locks = Arc::new(TargetLocks::new());
        let target = TargetId::new("app-1");
        let holder = JobId::generate();
        locks.claim(&target, &holder);

        assert!(!locks.release(&target, &JobId::generate()));
        assert_eq!(locks.holder(&target), Some(holder.clone()));
        assert!(locks.release(&target, &holder));
        assert!(locks.holder(&target).is_none());
    }
}
