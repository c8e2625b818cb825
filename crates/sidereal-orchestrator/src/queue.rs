//! Bounded FIFO job queue.
//!
//! The queue holds job references rather than records; records live in the
//! orchestrator's job table. Capacity counts admitted jobs that have not yet
//! left the queued state, including jobs a worker has taken out but not yet
//! started. A job that bounces off a busy target is requeued without being
//! re-admitted, so requeueing can never push the queue past its capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{JobId, TargetId};

/// Queue entry referencing a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    /// The job identifier.
    pub id: JobId,
    /// Target the job acts upon.
    pub target_id: TargetId,
}

impl QueuedJob {
    /// Create a queue entry.
    #[must_use]
    pub fn new(id: JobId, target_id: TargetId) -> Self {
        Self { id, target_id }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<QueuedJob>,
    admitted: usize,
}

/// Job queue shared by the submitters and the worker pool.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl JobQueue {
    /// Create a new queue admitting at most `capacity` jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Admit a new job at the tail.
    ///
    /// Fails fast with [`OrchestratorError::QueueFull`] rather than waiting
    /// for space.
    pub fn enqueue(&self, job: QueuedJob) -> OrchestratorResult<()> {
        {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return Err(OrchestratorError::ShuttingDown);
            }
            if inner.admitted >= self.capacity {
                return Err(OrchestratorError::QueueFull);
            }
            inner.admitted += 1;
            debug!(job_id = %job.id, target = %job.target_id, "job enqueued");
            inner.pending.push_back(job);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Put an already admitted job back at the tail.
    ///
    /// Accepted after [`close`](Self::close) so in-hand jobs are drained.
    pub fn requeue(&self, job: QueuedJob) {
        {
            let mut inner = self.inner.lock();
            debug!(job_id = %job.id, target = %job.target_id, "job requeued");
            inner.pending.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Re-admit a job recovered from the store, bypassing the capacity check.
    pub(crate) fn restore(&self, job: QueuedJob) {
        {
            let mut inner = self.inner.lock();
            inner.admitted += 1;
            inner.pending.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Wait for the next job.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.pending.pop_front() {
                    // Wake another waiter if more work remains.
                    if !inner.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(job);
                }
                if self.is_closed() {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next job without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedJob> {
        self.inner.lock().pending.pop_front()
    }

    /// Mark a dequeued job as having left the queued state.
    ///
    /// Frees its admission slot. Called once per admitted job, by the worker
    /// that starts or discards it.
    pub fn release_slot(&self) {
        let mut inner = self.inner.lock();
        inner.admitted = inner.admitted.saturating_sub(1);
    }

    /// Remove a pending job, freeing its slot.
    ///
    /// Returns `false` if the job is not waiting in the queue, for example
    /// because a worker currently holds it.
    pub fn remove(&self, id: &JobId) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.pending.iter().position(|job| &job.id == id) else {
            return false;
        };
        inner.pending.remove(pos);
        inner.admitted = inner.admitted.saturating_sub(1);
        true
    }

    /// Whether any waiting job satisfies `predicate`.
    pub fn any_pending<F>(&self, predicate: F) -> bool
    where
        F: Fn(&QueuedJob) -> bool,
    {
        self.inner.lock().pending.iter().any(predicate)
    }

    /// Stop admitting jobs and wake idle workers so they can drain and exit.
    pub fn close(&self) {
        {
            // Serialise with enqueue so nothing is admitted after close.
            let _inner = self.inner.lock();
            if !self.closed.swap(true, Ordering::AcqRel) {
                info!("job queue closed");
            }
        }
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of jobs waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether no jobs are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of admitted jobs that have not yet started.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.inner.lock().admitted
    }

    /// Maximum number of admitted jobs.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
