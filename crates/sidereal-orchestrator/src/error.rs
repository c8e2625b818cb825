//! Error types for the orchestrator.

use thiserror::Error;

use crate::types::JobState;

/// Errors that can occur while orchestrating jobs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Admission errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Job queue is at capacity.
    #[error("job queue is full")]
    QueueFull,

    /// The orchestrator is shutting down and accepts no new jobs.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Submitted request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Execution errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Another job holds the target. Internal, causes a requeue.
    #[error("target busy: {target} is held by job {holder}")]
    TargetBusy {
        /// Target identifier.
        target: String,
        /// Job currently holding the target.
        holder: String,
    },

    /// Control-plane adapter error.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: JobState,
        /// Attempted target state.
        to: JobState,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Query errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job has not reached a terminal state.
    #[error("job {id} is not finished (state: {state})")]
    JobNotTerminal {
        /// Job identifier.
        id: String,
        /// Current state.
        state: JobState,
    },

    /// Only failed or cancelled jobs can be resubmitted.
    #[error("job {id} cannot be resubmitted from state {state}")]
    NotResubmittable {
        /// Job identifier.
        id: String,
        /// Current state.
        state: JobState,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Event delivery errors
    // ─────────────────────────────────────────────────────────────────────────
    /// An event sink is already registered.
    #[error("an event sink is already registered")]
    SinkAlreadyRegistered,

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration and internal errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Create a job-not-found error.
    #[must_use]
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::JobNotFound(id.to_string())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<figment::Error> for OrchestratorError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Failure reported by a control-plane adapter.
///
/// The classification decides whether the worker retries the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Connection reset, timeout and similar conditions worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid configuration, unknown target and similar conditions.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl AdapterError {
    /// Create a transient error.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error.
    #[must_use]
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the call may succeed if retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The underlying message without the classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

/// Result type alias for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;
