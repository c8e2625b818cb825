//! Orchestrator service.
//!
//! Wires the job queue, the worker pool, the target lock table and the event
//! bus together, and owns startup, recovery and shutdown.

mod worker;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::ControlPlaneAdapter;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, EventKey, EventSink, JobEvent, Subscription};
use crate::job::{JobRecord, JobRequest};
use crate::lock::TargetLocks;
use crate::queue::{JobQueue, QueuedJob};
use crate::store::{JobFilter, JobStore};
use crate::types::{
    CancelOutcome, FailureKind, JobFailure, JobId, JobKind, JobResult, JobState, TargetId,
};

use worker::Worker;

/// Where the owning worker is within a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Not yet picked up.
    Waiting,
    /// An adapter call is in flight; cancellation must wait.
    Invoking,
    /// Waiting out a retry delay; cancellation is honoured.
    Backoff,
}

/// A job record plus the runtime state its worker coordinates through.
#[derive(Debug)]
pub(crate) struct JobEntry {
    pub(crate) record: JobRecord,
    pub(crate) phase: Phase,
    pub(crate) wake: CancellationToken,
    /// The target lock was claimed on the record's behalf during recovery
    /// rather than held by a live worker's guard.
    claimed: bool,
}

impl JobEntry {
    fn new(record: JobRecord) -> Self {
        Self {
            record,
            phase: Phase::Waiting,
            wake: CancellationToken::new(),
            claimed: false,
        }
    }

    fn recovered(record: JobRecord, claimed: bool) -> Self {
        Self {
            claimed,
            ..Self::new(record)
        }
    }
}

pub(crate) type EntryRef = Arc<Mutex<JobEntry>>;

/// State shared by the facade, the workers and the maintenance task.
pub(crate) struct Shared {
    pub(crate) config: OrchestratorConfig,
    pub(crate) queue: JobQueue,
    pub(crate) locks: Arc<TargetLocks>,
    pub(crate) events: EventBus,
    pub(crate) adapter: Arc<dyn ControlPlaneAdapter>,
    store: Arc<dyn JobStore>,
    jobs: DashMap<JobId, EntryRef>,
}

impl Shared {
    pub(crate) fn entry(&self, id: &JobId) -> Option<EntryRef> {
        self.jobs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every entry handle. Taken before locking any entry so no
    /// map guard is held while waiting on a record.
    fn entries(&self) -> Vec<EntryRef> {
        self.jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Publish the record's current state and persist it.
    ///
    /// Called with the entry locked, right after a transition.
    pub(crate) fn commit(&self, record: &mut JobRecord) {
        let event = JobEvent::state(record);
        self.events.publish(&event);
        self.persist(record);
    }

    pub(crate) fn persist(&self, record: &JobRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(job_id = %record.id, error = %e, "failed to persist job record");
        }
    }

    /// Fail running jobs whose heartbeat has gone stale.
    fn reap_orphans(&self) -> Vec<JobId> {
        let timeout = self.config.worker.heartbeat_timeout();
        let now = Utc::now();
        let mut orphaned = Vec::new();

        for entry in self.entries() {
            let mut entry = entry.lock();
            let claimed = entry.claimed;
            let record = &mut entry.record;
            if record.state != JobState::Running || !heartbeat_expired(record, now, timeout) {
                continue;
            }

            let failure = JobFailure::new(
                FailureKind::Orphaned,
                "owning worker stopped without reporting an outcome",
                record.attempt,
            );
            if let Err(e) = record.finish(JobResult::Failed(failure)) {
                error!(job_id = %record.id, error = %e, "failed to mark job orphaned");
                continue;
            }
            // A live worker still owns its guard and frees the target once
            // the adapter call returns.
            if claimed {
                self.locks.release(&record.target_id, &record.id);
            }
            warn!(job_id = %record.id, target = %record.target_id, "job orphaned");
            self.commit(record);
            orphaned.push(record.id.clone());
        }

        orphaned
    }

    /// Drop terminal records older than the retention period.
    fn evict_expired(&self) -> Vec<JobId> {
        let retention = self.config.jobs.retention();
        let now = Utc::now();

        let expired: Vec<JobId> = self
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.lock();
                let finished_at = entry.record.finished_at?;
                let expired = entry.record.is_terminal()
                    && (now - finished_at).to_std().map_or(false, |age| age >= retention);
                expired.then(|| entry.record.id.clone())
            })
            .collect();

        for id in &expired {
            self.jobs.remove(id);
            if let Err(e) = self.store.remove(id) {
                warn!(job_id = %id, error = %e, "failed to remove expired job record");
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired job records");
        }

        expired
    }

    /// Rebuild in-memory state from the store after a restart.
    fn recover(&self) -> OrchestratorResult<()> {
        let timeout = self.config.worker.heartbeat_timeout();
        let now = Utc::now();
        let mut requeued = 0usize;
        let mut orphaned = 0usize;

        for mut record in self.store.load()? {
            match record.state {
                JobState::Queued => {
                    self.queue
                        .restore(QueuedJob::new(record.id.clone(), record.target_id.clone()));
                    requeued += 1;
                }
                JobState::Running if heartbeat_expired(&record, now, timeout) => {
                    let failure = JobFailure::new(
                        FailureKind::Orphaned,
                        "orchestrator restarted while the job was running",
                        record.attempt,
                    );
                    record.finish(JobResult::Failed(failure))?;
                    self.persist(&record);
                    orphaned += 1;
                }
                JobState::Running => {
                    // Keep the target locked until the reaper resolves it.
                    self.locks.claim(&record.target_id, &record.id);
                }
                JobState::Succeeded | JobState::Failed | JobState::Cancelled => {}
            }
            let claimed = record.state == JobState::Running;
            self.jobs.insert(
                record.id.clone(),
                Arc::new(Mutex::new(JobEntry::recovered(record, claimed))),
            );
        }

        if requeued > 0 || orphaned > 0 {
            info!(requeued, orphaned, "recovered jobs from store");
        }
        Ok(())
    }
}

fn heartbeat_expired(
    record: &JobRecord,
    now: chrono::DateTime<Utc>,
    timeout: std::time::Duration,
) -> bool {
    let Some(last) = record.heartbeat_at.or(record.started_at) else {
        return true;
    };
    (now - last).to_std().map_or(false, |age| age > timeout)
}

/// Outcome of a maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs failed because their worker stopped heartbeating.
    pub orphaned: Vec<JobId>,
    /// Terminal jobs dropped after the retention period.
    pub evicted: Vec<JobId>,
}

/// Deployment job orchestrator.
///
/// Accepts job submissions, runs them on a fixed pool of workers with at
/// most one job per target at a time, and reports progress through the
/// event bus.
pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl Orchestrator {
    /// Start the orchestrator.
    ///
    /// Recovers jobs left in `store` by a previous run, then spawns the
    /// worker pool and the maintenance task on the current Tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        adapter: Arc<dyn ControlPlaneAdapter>,
        store: Arc<dyn JobStore>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OrchestratorError::internal(format!("no tokio runtime: {e}")))?;

        let shared = Arc::new(Shared {
            queue: JobQueue::new(config.queue.capacity),
            locks: Arc::new(TargetLocks::new()),
            events: EventBus::new(config.events.subscriber_buffer),
            adapter,
            store,
            jobs: DashMap::new(),
            config,
        });
        shared.recover()?;

        let count = shared.config.worker.count;
        let workers = (0..count)
            .map(|id| runtime.spawn(Worker::new(id, Arc::clone(&shared)).run()))
            .collect();
        info!(count, capacity = shared.config.queue.capacity, "worker pool started");

        let stop = CancellationToken::new();
        let maintenance = runtime.spawn(maintain(Arc::clone(&shared), stop.clone()));

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            maintenance: Mutex::new(Some(maintenance)),
            stop,
        })
    }

    /// Submit a job without a deploy source.
    pub fn submit(&self, target_id: impl Into<TargetId>, kind: JobKind) -> OrchestratorResult<JobId> {
        self.submit_request(JobRequest::new(target_id, kind))
    }

    /// Submit a job.
    ///
    /// Fails fast with [`OrchestratorError::QueueFull`] when the queue is at
    /// capacity.
    pub fn submit_request(&self, request: JobRequest) -> OrchestratorResult<JobId> {
        request.validate()?;
        if self.shared.queue.is_closed() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let record = JobRecord::new(request, self.shared.config.jobs.log_capacity);
        let id = record.id.clone();
        let target = record.target_id.clone();
        let kind = record.kind;

        let entry = Arc::new(Mutex::new(JobEntry::new(record)));
        self.shared.jobs.insert(id.clone(), Arc::clone(&entry));

        {
            // Hold the entry so a worker cannot start the job before the
            // queued event is out.
            let mut entry = entry.lock();
            if let Err(e) = self
                .shared
                .queue
                .enqueue(QueuedJob::new(id.clone(), target.clone()))
            {
                drop(entry);
                self.shared.jobs.remove(&id);
                warn!(target = %target, kind = %kind, error = %e, "job rejected");
                return Err(e);
            }
            self.shared.commit(&mut entry.record);
        }

        info!(job_id = %id, target = %target, kind = %kind, "job submitted");
        Ok(id)
    }

    /// Snapshot of a job record.
    pub fn get(&self, id: &JobId) -> OrchestratorResult<JobRecord> {
        self.shared
            .entry(id)
            .map(|entry| entry.lock().record.clone())
            .ok_or_else(|| OrchestratorError::not_found(id))
    }

    /// Snapshots of every job matching `filter`, oldest first.
    #[must_use]
    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .shared
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.lock();
                filter.matches(&entry.record).then(|| entry.record.clone())
            })
            .collect();
        records.sort_by_key(|record| record.submitted_at);
        records
    }

    /// Cancel a job.
    ///
    /// Queued jobs are cancelled immediately. Running jobs are cancelled only
    /// while their worker waits between retry attempts; with an adapter call
    /// in flight the result is [`CancelOutcome::TooLate`].
    pub fn cancel(&self, id: &JobId) -> OrchestratorResult<CancelOutcome> {
        let entry = self
            .shared
            .entry(id)
            .ok_or_else(|| OrchestratorError::not_found(id))?;
        let mut entry = entry.lock();

        match (entry.record.state, entry.phase) {
            (JobState::Queued, _) => {
                // A worker holding the job will see the state and drop it.
                self.shared.queue.remove(id);
                entry.record.finish(JobResult::Cancelled)?;
                self.shared.commit(&mut entry.record);
                info!(job_id = %id, "queued job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            (JobState::Running, Phase::Backoff) => {
                entry.record.finish(JobResult::Cancelled)?;
                entry.wake.cancel();
                self.shared.commit(&mut entry.record);
                info!(job_id = %id, attempt = entry.record.attempt, "running job cancelled between attempts");
                Ok(CancelOutcome::Cancelled)
            }
            (JobState::Running, _) => {
                debug!(job_id = %id, "adapter call in flight, cancellation refused");
                Ok(CancelOutcome::TooLate)
            }
            (state, _) => Ok(CancelOutcome::AlreadyFinished { state }),
        }
    }

    /// Drop a terminal job record now rather than after the retention period.
    pub fn acknowledge(&self, id: &JobId) -> OrchestratorResult<JobRecord> {
        let entry = self
            .shared
            .entry(id)
            .ok_or_else(|| OrchestratorError::not_found(id))?;
        let record = entry.lock().record.clone();
        if !record.is_terminal() {
            return Err(OrchestratorError::JobNotTerminal {
                id: id.to_string(),
                state: record.state,
            });
        }

        self.shared.jobs.remove(id);
        if let Err(e) = self.shared.store.remove(id) {
            warn!(job_id = %id, error = %e, "failed to remove acknowledged job record");
        }
        debug!(job_id = %id, "job acknowledged");
        Ok(record)
    }

    /// Submit a fresh job repeating a failed or cancelled one.
    ///
    /// The new job has its own id and starts again from the first attempt.
    pub fn resubmit(&self, id: &JobId) -> OrchestratorResult<JobId> {
        let record = self.get(id)?;
        if !matches!(record.state, JobState::Failed | JobState::Cancelled) {
            return Err(OrchestratorError::NotResubmittable {
                id: id.to_string(),
                state: record.state,
            });
        }

        let new_id = self.submit_request(record.request())?;
        info!(job_id = %new_id, previous = %id, "job resubmitted");
        Ok(new_id)
    }

    /// Fetch recent application logs for a target from the control plane.
    pub async fn fetch_target_logs(
        &self,
        target_id: &TargetId,
        tail: usize,
    ) -> OrchestratorResult<Vec<String>> {
        Ok(self.shared.adapter.fetch_logs(target_id, tail).await?)
    }

    /// Subscribe to events matching `key`.
    pub fn subscribe(&self, key: EventKey) -> Subscription {
        self.shared.events.subscribe(key)
    }

    /// Subscribe to a single job's events.
    pub fn subscribe_job(&self, id: &JobId) -> Subscription {
        self.subscribe(EventKey::Job(id.clone()))
    }

    /// Subscribe to events of every job acting on `target_id`.
    pub fn subscribe_target(&self, target_id: &TargetId) -> Subscription {
        self.subscribe(EventKey::Target(target_id.clone()))
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(EventKey::All)
    }

    /// Register the external event sink. Only one may be registered.
    pub fn register_sink(&self, sink: Arc<dyn EventSink>) -> OrchestratorResult<()> {
        self.shared.events.register_sink(sink)?;
        info!("event sink registered");
        Ok(())
    }

    /// Remove the external event sink.
    pub fn unregister_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.shared.events.unregister_sink()
    }

    /// Number of jobs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of targets currently held by a running job.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.locks.len()
    }

    /// Run orphan detection and retention eviction now.
    ///
    /// The maintenance task does the same every `jobs.sweep_interval_secs`.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            orphaned: self.shared.reap_orphans(),
            evicted: self.shared.evict_expired(),
        }
    }

    /// Stop accepting jobs and wind down the worker pool.
    ///
    /// Workers keep draining the queue until `shutdown.grace_secs` expires,
    /// after which they are aborted. Returns the jobs left unfinished.
    pub async fn shutdown(&self) -> Vec<JobRecord> {
        info!("orchestrator shutting down");
        self.shared.queue.close();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let grace = self.shared.config.shutdown.grace();

        let drained =
            tokio::time::timeout(grace, futures::future::join_all(workers.iter_mut())).await;
        let results = match drained {
            Ok(results) => results,
            Err(_) => {
                warn!(?grace, "shutdown grace period expired, aborting workers");
                for worker in &workers {
                    worker.abort();
                }
                futures::future::join_all(workers).await
            }
        };
        for result in results {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "worker task failed");
                }
            }
        }

        self.stop.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            if let Err(e) = maintenance.await {
                error!(error = %e, "maintenance task failed");
            }
        }

        let unfinished: Vec<JobRecord> = self
            .list(&JobFilter::new())
            .into_iter()
            .filter(|record| !record.is_terminal())
            .collect();
        for record in &unfinished {
            warn!(job_id = %record.id, target = %record.target_id, state = %record.state, "job left unfinished");
        }

        self.shared.events.close();
        info!(unfinished = unfinished.len(), "orchestrator shutdown complete");
        unfinished
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
        if let Some(maintenance) = self.maintenance.get_mut().take() {
            maintenance.abort();
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workers", &self.shared.config.worker.count)
            .field("pending", &self.shared.queue.len())
            .field("jobs", &self.shared.jobs.len())
            .finish_non_exhaustive()
    }
}

async fn maintain(shared: Arc<Shared>, stop: CancellationToken) {
    let period = shared.config.jobs.sweep_interval().max(std::time::Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = stop.cancelled() => break,

            _ = ticker.tick() => {
                let orphaned = shared.reap_orphans();
                let evicted = shared.evict_expired();
                if !orphaned.is_empty() || !evicted.is_empty() {
                    debug!(orphaned = orphaned.len(), evicted = evicted.len(), "maintenance sweep");
                }
            }
        }
    }
}
