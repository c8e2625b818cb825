//! Job worker implementation.
//!
//! Pulls jobs from the queue, takes the target lock and drives the adapter
//! through retries until the job reaches a terminal state.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::LogSink;
use crate::error::OrchestratorError;
use crate::events::JobEvent;
use crate::queue::QueuedJob;
use crate::types::{FailureKind, JobFailure, JobKind, JobResult, JobState, TargetId};

use super::{EntryRef, Phase, Shared};

/// Worker that processes jobs from the queue.
pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Run until the queue is closed and drained.
    pub(crate) async fn run(self) {
        info!(worker_id = self.id, "worker started");

        while let Some(job) = self.shared.queue.dequeue().await {
            self.process(job).await;
        }

        info!(worker_id = self.id, "worker stopped");
    }

    async fn process(&self, job: QueuedJob) {
        let Some(entry) = self.shared.entry(&job.id) else {
            self.shared.queue.release_slot();
            return;
        };
        if entry.lock().record.state != JobState::Queued {
            debug!(worker_id = self.id, job_id = %job.id, "skipping job that left the queue");
            self.shared.queue.release_slot();
            return;
        }

        let guard = match self.shared.locks.try_acquire(&job.target_id, &job.id) {
            Ok(guard) => guard,
            Err(OrchestratorError::TargetBusy { holder, .. }) => {
                debug!(
                    worker_id = self.id,
                    job_id = %job.id,
                    target = %job.target_id,
                    holder = %holder,
                    "target busy, requeueing job"
                );
                self.shared.queue.requeue(job);
                let runnable = self
                    .shared
                    .queue
                    .any_pending(|job| self.shared.locks.holder(&job.target_id).is_none());
                if !runnable {
                    tokio::time::sleep(self.shared.config.queue.requeue_delay()).await;
                }
                return;
            }
            Err(e) => {
                error!(worker_id = self.id, job_id = %job.id, error = %e, "failed to lock target");
                self.shared.queue.requeue(job);
                return;
            }
        };

        let (kind, source) = {
            let mut entry = entry.lock();
            // Cancellation may have landed while the lock was being taken.
            if entry.record.state != JobState::Queued {
                self.shared.queue.release_slot();
                return;
            }
            if let Err(e) = entry.record.start() {
                error!(worker_id = self.id, job_id = %job.id, error = %e, "failed to start job");
                self.shared.queue.release_slot();
                return;
            }
            entry.phase = Phase::Invoking;
            self.shared.commit(&mut entry.record);
            (entry.record.kind, entry.record.source.clone())
        };
        self.shared.queue.release_slot();

        info!(
            worker_id = self.id,
            job_id = %job.id,
            target = %job.target_id,
            kind = %kind,
            "job started"
        );

        if let Some(result) = self
            .execute(&entry, &job.target_id, kind, source.as_deref())
            .await
        {
            self.finish(&entry, result);
        }

        drop(guard);
    }

    /// Invoke the adapter until it succeeds, fails for good or the job is
    /// cancelled between attempts.
    ///
    /// Returns `None` when the record was resolved by someone else.
    async fn execute(
        &self,
        entry: &EntryRef,
        target: &TargetId,
        kind: JobKind,
        source: Option<&str>,
    ) -> Option<JobResult> {
        let retry = &self.shared.config.retry;
        let sink = JobLogSink {
            entry,
            shared: &self.shared,
        };

        loop {
            let attempt = {
                let mut entry = entry.lock();
                if entry.record.is_terminal() {
                    info!(
                        worker_id = self.id,
                        job_id = %entry.record.id,
                        state = %entry.record.state,
                        "job resolved between attempts"
                    );
                    return None;
                }
                entry.record.attempt += 1;
                entry.phase = Phase::Invoking;
                self.shared.persist(&entry.record);
                entry.record.attempt
            };
            debug!(worker_id = self.id, target = %target, attempt, "invoking adapter");

            let call = AssertUnwindSafe(self.shared.adapter.execute(kind, target, source, &sink))
                .catch_unwind();
            let error = match self.with_heartbeat(entry, call).await {
                Ok(Ok(())) => return Some(JobResult::Succeeded),
                Ok(Err(error)) => error,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(worker_id = self.id, target = %target, attempt, panic = %message, "adapter call panicked");
                    return Some(JobResult::Failed(JobFailure::new(
                        FailureKind::Orphaned,
                        format!("adapter call panicked: {message}"),
                        attempt,
                    )));
                }
            };

            if !error.is_retryable() {
                return Some(JobResult::Failed(JobFailure::new(
                    FailureKind::Permanent,
                    error.message(),
                    attempt,
                )));
            }
            if attempt >= retry.max_attempts {
                return Some(JobResult::Failed(JobFailure::new(
                    FailureKind::RetriesExhausted,
                    error.message(),
                    attempt,
                )));
            }

            let delay = retry.backoff(attempt);
            warn!(
                worker_id = self.id,
                target = %target,
                attempt,
                ?delay,
                error = %error,
                "transient adapter failure, retrying"
            );

            let wake = {
                let mut entry = entry.lock();
                entry.phase = Phase::Backoff;
                entry.wake.clone()
            };
            self.with_heartbeat(entry, async {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = wake.cancelled() => {}
                }
            })
            .await;
        }
    }

    /// Drive `fut` to completion, stamping the record's heartbeat meanwhile.
    async fn with_heartbeat<F: Future>(&self, entry: &EntryRef, fut: F) -> F::Output {
        let period = self.shared.config.worker.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(fut);

        loop {
            tokio::select! {
                output = &mut fut => return output,
                _ = ticker.tick() => {
                    let mut entry = entry.lock();
                    if entry.record.state == JobState::Running {
                        entry.record.beat();
                        self.shared.persist(&entry.record);
                    }
                }
            }
        }
    }

    fn finish(&self, entry: &EntryRef, result: JobResult) {
        let mut entry = entry.lock();
        let job_id = entry.record.id.clone();

        if let Err(e) = entry.record.finish(result) {
            warn!(worker_id = self.id, job_id = %job_id, error = %e, "discarding outcome of resolved job");
            return;
        }
        self.shared.commit(&mut entry.record);

        let record = &entry.record;
        match record.failure() {
            None => info!(
                worker_id = self.id,
                job_id = %job_id,
                target = %record.target_id,
                attempt = record.attempt,
                "job succeeded"
            ),
            Some(failure) => error!(
                worker_id = self.id,
                job_id = %job_id,
                target = %record.target_id,
                attempt = record.attempt,
                failure = %failure,
                "job failed"
            ),
        }
    }
}

/// Appends adapter output to the job record and publishes it.
struct JobLogSink<'a> {
    entry: &'a EntryRef,
    shared: &'a Shared,
}

impl LogSink for JobLogSink<'_> {
    fn emit(&self, line: &str) {
        let mut entry = self.entry.lock();
        if entry.record.is_terminal() {
            return;
        }
        entry.record.logs.push(line);
        let event = JobEvent::log(&mut entry.record, line);
        self.shared.events.publish(&event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
