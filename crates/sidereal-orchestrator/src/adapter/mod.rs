//! Control-plane adapters.
//!
//! An adapter performs lifecycle operations against the platform hosting the
//! target applications. Calls may take minutes and cannot be interrupted
//! once started; the worker pool bounds how many run at once.

mod command;
mod scripted;

pub use command::CommandAdapter;
pub use scripted::{ScriptedAdapter, ScriptedCall, ScriptedStep, StepOutcome};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AdapterConfig, AdapterKind};
use crate::error::{AdapterResult, OrchestratorResult};
use crate::types::{JobKind, TargetId};

/// Receives output lines as an adapter call produces them.
pub trait LogSink: Send + Sync {
    /// Forward one line.
    fn emit(&self, line: &str);
}

/// Discards every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _line: &str) {}
}

/// Client for the external platform control plane.
#[async_trait]
pub trait ControlPlaneAdapter: Send + Sync {
    /// Create or update the application and roll out `source`.
    async fn deploy(
        &self,
        target: &TargetId,
        source: Option<&str>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()>;

    /// Restart the application.
    async fn restart(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()>;

    /// Stop the application.
    async fn stop(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()>;

    /// Destroy the application.
    async fn delete(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()>;

    /// Fetch the last `tail` application log lines, oldest first.
    async fn fetch_logs(&self, target: &TargetId, tail: usize) -> AdapterResult<Vec<String>>;

    /// Run the operation matching `kind`.
    async fn execute(
        &self,
        kind: JobKind,
        target: &TargetId,
        source: Option<&str>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()> {
        match kind {
            JobKind::Deploy => self.deploy(target, source, logs).await,
            JobKind::Restart => self.restart(target, logs).await,
            JobKind::Stop => self.stop(target, logs).await,
            JobKind::Delete => self.delete(target, logs).await,
        }
    }
}

/// Create an adapter from configuration.
pub fn create_adapter(config: &AdapterConfig) -> OrchestratorResult<Arc<dyn ControlPlaneAdapter>> {
    match config.kind {
        AdapterKind::Command => Ok(Arc::new(CommandAdapter::new(config.clone())?)),
        AdapterKind::Scripted => Ok(Arc::new(ScriptedAdapter::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_configured_adapter() {
        let config = AdapterConfig {
            kind: AdapterKind::Scripted,
            ..AdapterConfig::default()
        };
        assert!(create_adapter(&config).is_ok());

        let config = AdapterConfig {
            program: String::new(),
            ..AdapterConfig::default()
        };
        assert!(create_adapter(&config).is_err());
    }

    #[tokio::test]
    async fn execute_dispatches_by_kind() {
        let adapter = ScriptedAdapter::new();
        let target = TargetId::new("app-1");
        for kind in [JobKind::Deploy, JobKind::Restart, JobKind::Stop, JobKind::Delete] {
            adapter
                .execute(kind, &target, None, &NullSink)
                .await
                .expect("scripted success");
        }

        let kinds: Vec<JobKind> = adapter.calls().into_iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![JobKind::Deploy, JobKind::Restart, JobKind::Stop, JobKind::Delete]
        );
    }
}
