//! Common test utilities for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sidereal_orchestrator::config::{JobsConfig, QueueConfig, RetryConfig, WorkerConfig};
use sidereal_orchestrator::{
    ControlPlaneAdapter, JobId, JobRecord, JobStore, MemoryJobStore, Orchestrator,
    OrchestratorConfig, ScriptedAdapter,
};

/// Orchestrator wired to a scripted adapter and an in-memory store.
pub struct TestOrchestrator {
    pub orchestrator: Orchestrator,
    pub adapter: Arc<ScriptedAdapter>,
    pub store: Arc<MemoryJobStore>,
}

impl TestOrchestrator {
    /// Creates a test orchestrator with fast timings.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a test orchestrator with `workers` workers and fast timings.
    pub fn with_workers(workers: usize) -> Self {
        let mut config = fast_config();
        config.worker.count = workers;
        Self::with_config(config)
    }

    /// Creates a test orchestrator with custom configuration.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_parts(config, ScriptedAdapter::new(), Arc::new(MemoryJobStore::new()))
    }

    /// Creates a test orchestrator over an existing adapter and store.
    pub fn with_parts(
        config: OrchestratorConfig,
        adapter: ScriptedAdapter,
        store: Arc<MemoryJobStore>,
    ) -> Self {
        let adapter = Arc::new(adapter);
        let orchestrator = Orchestrator::start(
            config,
            Arc::clone(&adapter) as Arc<dyn ControlPlaneAdapter>,
            Arc::clone(&store) as Arc<dyn JobStore>,
        )
        .expect("orchestrator starts");

        Self {
            orchestrator,
            adapter,
            store,
        }
    }

    /// Waits until the job reaches a terminal state.
    pub async fn wait_terminal(&self, id: &JobId) -> JobRecord {
        self.wait_for(id, JobRecord::is_terminal).await
    }

    /// Waits until the job record satisfies `condition`.
    pub async fn wait_for<F>(&self, id: &JobId, condition: F) -> JobRecord
    where
        F: Fn(&JobRecord) -> bool,
    {
        wait_for_record(&self.orchestrator, id, condition).await
    }
}

/// Polls `orchestrator` until the job record satisfies `condition`.
pub async fn wait_for_record<F>(orchestrator: &Orchestrator, id: &JobId, condition: F) -> JobRecord
where
    F: Fn(&JobRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = orchestrator.get(id).expect("job exists");
        if condition(&record) {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {id}, last state {}",
            record.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

impl Default for TestOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with short delays suited to tests.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        queue: QueueConfig {
            capacity: 100,
            requeue_delay_ms: 5,
        },
        worker: WorkerConfig {
            count: 4,
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 3,
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        },
        jobs: JobsConfig {
            log_capacity: 100,
            retention_secs: 3600,
            sweep_interval_secs: 3600,
        },
        ..OrchestratorConfig::default()
    }
}
