//! Sidereal orchestrator binary.
//!
//! Runs the deployment job orchestrator against the configured control-plane
//! adapter until interrupted.
//!
//! Job records live in a [`MemoryJobStore`], so nothing survives a restart
//! and the recovery pass in [`Orchestrator::start`] finds an empty store.
//! Deployments that need jobs to be orphaned or re-enqueued across restarts
//! embed the library and pass a durable [`JobStore`] implementation from
//! their persistence layer to [`Orchestrator::start`] instead.
//!
//! [`JobStore`]: sidereal_orchestrator::JobStore

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sidereal_orchestrator::{
    create_adapter, EventPayload, JobEvent, MemoryJobStore, Orchestrator, OrchestratorConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sidereal_orchestrator=info".parse()?),
        )
        .init();

    info!("Sidereal orchestrator starting");

    let config = OrchestratorConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        OrchestratorConfig::default()
    });

    info!(
        worker_count = config.worker.count,
        queue_capacity = config.queue.capacity,
        max_attempts = config.retry.max_attempts,
        adapter = ?config.adapter.kind,
        "configuration loaded"
    );

    let adapter = create_adapter(&config.adapter)?;
    // Not durable: see the module docs.
    let store = Arc::new(MemoryJobStore::new());
    info!("job records are kept in memory and will not survive a restart");
    let orchestrator = Orchestrator::start(config, adapter, store)?;

    orchestrator.register_sink(Arc::new(|event: &JobEvent| match &event.payload {
        EventPayload::State { state, .. } => {
            info!(job_id = %event.job_id, target = %event.target_id, state = %state, "job state changed");
        }
        EventPayload::Log { line } => {
            info!(job_id = %event.job_id, target = %event.target_id, line = %line, "job output");
        }
    }))?;

    shutdown_signal().await;

    let unfinished = orchestrator.shutdown().await;
    if !unfinished.is_empty() {
        warn!(
            count = unfinished.len(),
            "jobs left unfinished at shutdown"
        );
    }

    info!("orchestrator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
