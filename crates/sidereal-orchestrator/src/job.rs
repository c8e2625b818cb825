//! Job records and their state machine.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{JobFailure, JobId, JobKind, JobResult, JobState, TargetId};

/// A request to run an operation against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target to act upon.
    pub target_id: TargetId,
    /// Operation to run.
    pub kind: JobKind,
    /// Release source for deploys (image reference, git ref or path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl JobRequest {
    /// Create a new job request.
    #[must_use]
    pub fn new(target_id: impl Into<TargetId>, kind: JobKind) -> Self {
        Self {
            target_id: target_id.into(),
            kind,
            source: None,
        }
    }

    /// Attach a deploy source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Check the request is well formed.
    pub fn validate(&self) -> OrchestratorResult<()> {
        let target = self.target_id.as_str();
        if target.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "target id must not be empty".to_owned(),
            ));
        }
        if target.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "target id contains whitespace or control characters: {target:?}"
            )));
        }
        if self.kind != JobKind::Deploy && self.source.is_some() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "a source is only accepted for deploy jobs, not {}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Append-only log with oldest-line eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
        self.lines.push_back(line.into());
    }

    /// Iterate over retained lines in emission order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Retained lines as an owned vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no lines are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines dropped to respect the capacity.
    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// The lifecycle record of one requested operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: JobId,
    /// Target the job acts upon.
    pub target_id: TargetId,
    /// Requested operation.
    pub kind: JobKind,
    /// Deploy source, if any.
    pub source: Option<String>,
    /// Current lifecycle state.
    pub state: JobState,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the job entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last liveness stamp from the owning worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Adapter invocations so far.
    pub attempt: u32,
    /// Captured output.
    pub logs: LogBuffer,
    /// Outcome once terminal.
    pub result: Option<JobResult>,
    /// Sequence number of the last event published for this job.
    pub last_sequence: u64,
}

impl JobRecord {
    /// Create a queued record for a request.
    #[must_use]
    pub fn new(request: JobRequest, log_capacity: usize) -> Self {
        Self::with_id(JobId::generate(), request, log_capacity)
    }

    /// Create a queued record with a specific ID.
    #[must_use]
    pub fn with_id(id: JobId, request: JobRequest, log_capacity: usize) -> Self {
        Self {
            id,
            target_id: request.target_id,
            kind: request.kind,
            source: request.source,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            attempt: 0,
            logs: LogBuffer::new(log_capacity),
            result: None,
            last_sequence: 0,
        }
    }

    /// The request this record was created from.
    #[must_use]
    pub fn request(&self) -> JobRequest {
        JobRequest {
            target_id: self.target_id.clone(),
            kind: self.kind,
            source: self.source.clone(),
        }
    }

    /// Check if the job has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Failure detail, if the job failed.
    #[must_use]
    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.result {
            Some(JobResult::Failed(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Enter `Running`. Called once the target lock is held.
    pub fn start(&mut self) -> OrchestratorResult<()> {
        self.transition(JobState::Running)?;
        let now = Utc::now();
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// Enter the terminal state matching `result`.
    pub fn finish(&mut self, result: JobResult) -> OrchestratorResult<()> {
        self.transition(result.state())?;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    /// Record a heartbeat from the owning worker.
    pub fn beat(&mut self) {
        self.heartbeat_at = Some(Utc::now());
    }

    /// Allocate the sequence number for the next published event.
    pub fn next_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    fn transition(&mut self, next: JobState) -> OrchestratorResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
