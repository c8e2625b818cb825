//! Configuration for sidereal-orchestrator.

use std::collections::BTreeMap;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrchestratorConfig {
    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry behaviour for transient adapter failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Job record retention.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Control-plane adapter configuration.
    #[serde(default)]
    pub adapter: AdapterConfig,
}

impl OrchestratorConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `orchestrator.toml` in the current directory (if present)
    /// 3. Environment variables with `SIDEREAL_ORCHESTRATOR_` prefix
    pub fn load() -> OrchestratorResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("orchestrator.toml"))
                .merge(Env::prefixed("SIDEREAL_ORCHESTRATOR_").split("__")),
        )
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> OrchestratorResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("SIDEREAL_ORCHESTRATOR_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> OrchestratorResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.queue.capacity == 0 {
            return Err(OrchestratorError::Config(
                "queue.capacity must be at least 1".to_owned(),
            ));
        }
        if self.worker.count == 0 {
            return Err(OrchestratorError::Config(
                "worker.count must be at least 1".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.worker.heartbeat_interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "worker.heartbeat_interval_secs must be at least 1".to_owned(),
            ));
        }
        if self.worker.heartbeat_timeout_secs <= self.worker.heartbeat_interval_secs {
            return Err(OrchestratorError::Config(
                "worker.heartbeat_timeout_secs must exceed worker.heartbeat_interval_secs"
                    .to_owned(),
            ));
        }
        if self.events.subscriber_buffer == 0 {
            return Err(OrchestratorError::Config(
                "events.subscriber_buffer must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting to start.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Pause after requeueing a job whose target is busy, in milliseconds.
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

impl QueueConfig {
    /// Requeue pause as a Duration.
    #[must_use]
    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

const fn default_queue_capacity() -> usize {
    100
}

const fn default_requeue_delay_ms() -> u64 {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// How often a busy worker stamps its job's heartbeat (seconds).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Age after which a running job without heartbeat is orphaned (seconds).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl WorkerConfig {
    /// Heartbeat interval as a Duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout as a Duration.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

const fn default_worker_count() -> usize {
    4
}

const fn default_heartbeat_interval_secs() -> u64 {
    5
}

const fn default_heartbeat_timeout_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

/// Retry configuration for transient adapter failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total adapter attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay between attempts, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Delay to wait after `attempt` failed transiently.
    ///
    /// Doubles with each attempt, capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let max = Duration::from_millis(self.max_backoff_ms);
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        initial.saturating_mul(multiplier).min(max)
    }
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Job record configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Maximum log lines kept per job.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// How long terminal jobs stay queryable (seconds).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How often retention and orphan checks run (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl JobsConfig {
    /// Retention as a Duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Sweep interval as a Duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

const fn default_log_capacity() -> usize {
    1000
}

const fn default_retention_secs() -> u64 {
    3600
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

const fn default_subscriber_buffer() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long workers may keep draining before they are aborted (seconds).
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl ShutdownConfig {
    /// Grace period as a Duration.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

const fn default_grace_secs() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

/// Type of control-plane adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Drive an external PaaS command-line tool.
    #[default]
    Command,

    /// In-process adapter that succeeds without side effects.
    Scripted,
}

/// Control-plane adapter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Adapter implementation.
    #[serde(default)]
    pub kind: AdapterKind,

    /// Program to execute for every operation.
    #[serde(default = "default_program")]
    pub program: String,

    /// Argument templates per operation.
    #[serde(default)]
    pub commands: CommandTemplates,

    /// Extra environment variables for the program.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Timeout for a single program run (seconds).
    #[serde(default = "default_adapter_timeout_secs")]
    pub timeout_secs: u64,

    /// Exit codes that indicate a transient failure.
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

impl AdapterConfig {
    /// Timeout as a Duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_program() -> String {
    "paas".to_owned()
}

const fn default_adapter_timeout_secs() -> u64 {
    900 // 15 minutes
}

fn default_transient_exit_codes() -> Vec<i32> {
    // EX_UNAVAILABLE, EX_TEMPFAIL
    vec![69, 75]
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::default(),
            program: default_program(),
            commands: CommandTemplates::default(),
            env: BTreeMap::new(),
            timeout_secs: default_adapter_timeout_secs(),
            transient_exit_codes: default_transient_exit_codes(),
        }
    }
}

/// Argument templates for each adapter operation.
///
/// Arguments may contain `{target}`, `{source}` and `{tail}` placeholders.
/// An argument that renders to an empty string is dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandTemplates {
    /// Create the application before deploying. Skipped when absent.
    #[serde(default)]
    pub create: Option<Vec<String>>,

    /// Apply configuration before deploying. Skipped when absent.
    #[serde(default)]
    pub configure: Option<Vec<String>>,

    /// Roll out a release.
    #[serde(default = "default_deploy_args")]
    pub deploy: Vec<String>,

    /// Restart the application.
    #[serde(default = "default_restart_args")]
    pub restart: Vec<String>,

    /// Stop the application.
    #[serde(default = "default_stop_args")]
    pub stop: Vec<String>,

    /// Destroy the application.
    #[serde(default = "default_delete_args")]
    pub delete: Vec<String>,

    /// Print recent application logs.
    #[serde(default = "default_logs_args")]
    pub logs: Vec<String>,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn default_deploy_args() -> Vec<String> {
    args(&["deploy", "--app", "{target}", "{source}"])
}

fn default_restart_args() -> Vec<String> {
    args(&["restart", "--app", "{target}"])
}

fn default_stop_args() -> Vec<String> {
    args(&["stop", "--app", "{target}"])
}

fn default_delete_args() -> Vec<String> {
    args(&["destroy", "--app", "{target}", "--yes"])
}

fn default_logs_args() -> Vec<String> {
    args(&["logs", "--app", "{target}", "--lines", "{tail}"])
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            create: None,
            configure: None,
            deploy: default_deploy_args(),
            restart: default_restart_args(),
            stop: default_stop_args(),
            delete: default_delete_args(),
            logs: default_logs_args(),
        }
    }
}
