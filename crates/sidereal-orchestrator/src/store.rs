//! Job record persistence.
//!
//! The orchestrator keeps the canonical record set in memory and mirrors
//! every transition and heartbeat into a [`JobStore`] so a restarted process
//! can recover queued jobs and detect orphaned ones.

use dashmap::DashMap;

use crate::error::OrchestratorResult;
use crate::job::JobRecord;
use crate::types::{JobId, JobState, TargetId};

/// Filter criteria for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by target.
    pub target_id: Option<TargetId>,
    /// Filter by state.
    pub state: Option<JobState>,
}

impl JobFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            target_id: None,
            state: None,
        }
    }

    /// Filter by target.
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<TargetId>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Filter by state.
    #[must_use]
    pub const fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Check whether a record matches.
    #[must_use]
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.target_id
            .as_ref()
            .map_or(true, |target| &record.target_id == target)
            && self.state.map_or(true, |state| record.state == state)
    }
}

/// Durable mirror of job records.
///
/// Writes are made while the record is locked, so implementations must be
/// quick; buffer writes internally if the backing store is slow.
pub trait JobStore: Send + Sync {
    /// Insert or replace a record.
    fn save(&self, record: &JobRecord) -> OrchestratorResult<()>;

    /// Remove a record.
    fn remove(&self, id: &JobId) -> OrchestratorResult<()>;

    /// Load every stored record.
    fn load(&self) -> OrchestratorResult<Vec<JobRecord>>;
}

/// In-memory job store.
///
/// Survives orchestrator restarts within one process only; useful for tests
/// and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: DashMap<JobId, JobRecord>,
}

impl MemoryJobStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored record.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, record: &JobRecord) -> OrchestratorResult<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &JobId) -> OrchestratorResult<()> {
        self.records.remove(id);
        Ok(())
    }

    fn load(&self) -> OrchestratorResult<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.submitted_at);
        Ok(records)
    }
}
