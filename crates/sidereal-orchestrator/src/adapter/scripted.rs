//! In-process adapter driven by scripted outcomes.
//!
//! Each target has a queue of steps consumed one per call; when the queue is
//! empty the call succeeds after the default delay. The adapter records every
//! call and tracks how many calls overlapped, per target and overall.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{JobKind, TargetId};

use super::{ControlPlaneAdapter, LogSink};

/// How a scripted call ends.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Return success.
    Succeed,
    /// Return the given error.
    Fail(AdapterError),
    /// Panic with the given message, simulating a crashed call.
    Panic(String),
}

/// One scripted adapter call.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    /// Lines emitted before the delay.
    pub lines: Vec<String>,
    /// How long the call takes.
    pub delay: Duration,
    /// How the call ends.
    pub outcome: StepOutcome,
}

impl ScriptedStep {
    /// A call that succeeds immediately.
    #[must_use]
    pub const fn succeed() -> Self {
        Self::ending(StepOutcome::Succeed)
    }

    /// A call that fails with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ending(StepOutcome::Fail(AdapterError::transient(message)))
    }

    /// A call that fails with a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::ending(StepOutcome::Fail(AdapterError::permanent(message)))
    }

    /// A call that panics.
    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self::ending(StepOutcome::Panic(message.into()))
    }

    const fn ending(outcome: StepOutcome) -> Self {
        Self {
            lines: Vec::new(),
            delay: Duration::ZERO,
            outcome,
        }
    }

    /// Emit these lines during the call.
    #[must_use]
    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Take this long before returning.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Record of one call made to the adapter.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// Target of the call.
    pub target: TargetId,
    /// Operation requested.
    pub kind: JobKind,
    /// Deploy source passed in.
    pub source: Option<String>,
    /// When the call started.
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Concurrency {
    active: HashMap<TargetId, usize>,
    peak: HashMap<TargetId, usize>,
    total_active: usize,
    total_peak: usize,
}

/// Adapter returning scripted outcomes.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    steps: Mutex<HashMap<TargetId, VecDeque<ScriptedStep>>>,
    default_delay: Duration,
    calls: Mutex<Vec<ScriptedCall>>,
    concurrency: Mutex<Concurrency>,
    output: Mutex<HashMap<TargetId, Vec<String>>>,
}

impl ScriptedAdapter {
    /// Create an adapter where every call succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make unscripted calls take `delay`.
    #[must_use]
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Append a step for the next call against `target`.
    pub fn push(&self, target: impl Into<TargetId>, step: ScriptedStep) {
        self.steps
            .lock()
            .entry(target.into())
            .or_default()
            .push_back(step);
    }

    /// Append several steps for `target`.
    pub fn push_all<I>(&self, target: impl Into<TargetId>, steps: I)
    where
        I: IntoIterator<Item = ScriptedStep>,
    {
        self.steps
            .lock()
            .entry(target.into())
            .or_default()
            .extend(steps);
    }

    /// Every call made so far, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    /// Calls made against `target`.
    #[must_use]
    pub fn calls_for(&self, target: &TargetId) -> Vec<ScriptedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| &call.target == target)
            .cloned()
            .collect()
    }

    /// Highest number of overlapping calls observed against `target`.
    #[must_use]
    pub fn peak_concurrency(&self, target: &TargetId) -> usize {
        self.concurrency
            .lock()
            .peak
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of overlapping calls observed overall.
    #[must_use]
    pub fn peak_total_concurrency(&self) -> usize {
        self.concurrency.lock().total_peak
    }

    async fn run(
        &self,
        kind: JobKind,
        target: &TargetId,
        source: Option<&str>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()> {
        let step = self
            .steps
            .lock()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ScriptedStep::succeed().with_delay(self.default_delay));

        debug!(target = %target, kind = %kind, "scripted call");
        self.calls.lock().push(ScriptedCall {
            target: target.clone(),
            kind,
            source: source.map(str::to_owned),
            started_at: Instant::now(),
        });

        let _active = ActiveCall::enter(self, target);

        for line in &step.lines {
            logs.emit(line);
            self.output
                .lock()
                .entry(target.clone())
                .or_default()
                .push(line.clone());
        }

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        match step.outcome {
            StepOutcome::Succeed => Ok(()),
            StepOutcome::Fail(error) => Err(error),
            StepOutcome::Panic(message) => panic!("{message}"),
        }
    }
}

/// Tracks one in-flight call; leaving is recorded on drop, including unwinds.
struct ActiveCall<'a> {
    adapter: &'a ScriptedAdapter,
    target: TargetId,
}

impl<'a> ActiveCall<'a> {
    fn enter(adapter: &'a ScriptedAdapter, target: &TargetId) -> Self {
        let mut concurrency = adapter.concurrency.lock();
        let active = concurrency.active.entry(target.clone()).or_default();
        *active += 1;
        let active = *active;
        let peak = concurrency.peak.entry(target.clone()).or_default();
        *peak = (*peak).max(active);
        concurrency.total_active += 1;
        concurrency.total_peak = concurrency.total_peak.max(concurrency.total_active);

        Self {
            adapter,
            target: target.clone(),
        }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut concurrency = self.adapter.concurrency.lock();
        if let Some(active) = concurrency.active.get_mut(&self.target) {
            *active = active.saturating_sub(1);
        }
        concurrency.total_active = concurrency.total_active.saturating_sub(1);
    }
}

#[async_trait]
impl ControlPlaneAdapter for ScriptedAdapter {
    async fn deploy(
        &self,
        target: &TargetId,
        source: Option<&str>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()> {
        self.run(JobKind::Deploy, target, source, logs).await
    }

    async fn restart(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        self.run(JobKind::Restart, target, None, logs).await
    }

    async fn stop(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        self.run(JobKind::Stop, target, None, logs).await
    }

    async fn delete(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        self.run(JobKind::Delete, target, None, logs).await
    }

    async fn fetch_logs(&self, target: &TargetId, tail: usize) -> AdapterResult<Vec<String>> {
        let output = self.output.lock();
        let lines = output.get(target).map(Vec::as_slice).unwrap_or_default();
        Ok(lines[lines.len().saturating_sub(tail)..].to_vec())
    }
}
