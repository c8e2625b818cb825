//! Deployment job orchestration for Sidereal targets.
//!
//! This crate provides:
//! - A bounded job queue with fail-fast admission
//! - A fixed worker pool running lifecycle operations through a control-plane adapter
//! - Per-target locking so operations on one application never overlap
//! - Retries with exponential backoff for transient adapter failures
//! - Ordered job events fanned out to subscribers and an external sink
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Orchestrator │───▶│  Job Queue   │───▶│ Worker Pool  │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!        │                                       │
//!        │             ┌─────────────────────────┤
//!        ▼             ▼                         ▼
//!  ┌──────────────┐  ┌──────────────┐    ┌──────────────┐
//!  │  Event Bus   │  │ Target Locks │    │   Adapter    │
//!  └──────────────┘  └──────────────┘    └──────────────┘
//! ```

#![forbid(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod lock;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;

// Re-export configuration types
pub use config::OrchestratorConfig;

// Re-export error types
pub use error::{AdapterError, AdapterResult, OrchestratorError, OrchestratorResult};

// Re-export core types
pub use types::{
    CancelOutcome, FailureKind, JobFailure, JobId, JobKind, JobResult, JobState, TargetId,
};

// Re-export job types
pub use job::{JobRecord, JobRequest, LogBuffer};

// Re-export adapter types
pub use adapter::{create_adapter, CommandAdapter, ControlPlaneAdapter, LogSink, ScriptedAdapter};

// Re-export event types
pub use events::{EventBus, EventKey, EventPayload, EventSink, JobEvent, Subscription};

// Re-export storage types
pub use store::{JobFilter, JobStore, MemoryJobStore};

// Re-export service types
pub use service::{Orchestrator, SweepReport};
