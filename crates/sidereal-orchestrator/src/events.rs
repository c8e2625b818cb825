//! Job event bus.
//!
//! Publishes state transitions and log lines to subscribers keyed by job,
//! by target, or to everything. Each subscriber has its own bounded buffer;
//! a subscriber that falls behind loses its oldest undelivered events
//! instead of holding up publication. Nothing is retained for late
//! subscribers: the job record is the authoritative history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::job::JobRecord;
use crate::types::{JobId, JobResult, JobState, TargetId};

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The job entered a new state.
    State {
        /// New state.
        state: JobState,
        /// Outcome, present once terminal.
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<JobResult>,
    },
    /// The adapter produced an output line.
    Log {
        /// The line, without trailing newline.
        line: String,
    },
}

/// A single job event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job the event belongs to.
    pub job_id: JobId,
    /// Target of that job.
    pub target_id: TargetId,
    /// Per-job sequence number, starting at 1 with no gaps at the producer.
    pub sequence: u64,
    /// When the event was produced.
    pub at: DateTime<Utc>,
    /// Event body.
    pub payload: EventPayload,
}

impl JobEvent {
    /// Build a state event from the record's current state.
    ///
    /// Allocates the next sequence number on the record.
    pub fn state(record: &mut JobRecord) -> Self {
        let payload = EventPayload::State {
            state: record.state,
            result: record.result.clone(),
        };
        Self::next(record, payload)
    }

    /// Build a log event.
    ///
    /// Allocates the next sequence number on the record.
    pub fn log(record: &mut JobRecord, line: impl Into<String>) -> Self {
        Self::next(record, EventPayload::Log { line: line.into() })
    }

    fn next(record: &mut JobRecord, payload: EventPayload) -> Self {
        Self {
            job_id: record.id.clone(),
            target_id: record.target_id.clone(),
            sequence: record.next_sequence(),
            at: Utc::now(),
            payload,
        }
    }

    /// The new state, if this is a state event.
    #[must_use]
    pub const fn new_state(&self) -> Option<JobState> {
        match &self.payload {
            EventPayload::State { state, .. } => Some(*state),
            EventPayload::Log { .. } => None,
        }
    }

    /// The log line, if this is a log event.
    #[must_use]
    pub fn log_line(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Log { line } => Some(line),
            EventPayload::State { .. } => None,
        }
    }
}

/// Subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Events of a single job.
    Job(JobId),
    /// Events of every job acting on a target.
    Target(TargetId),
    /// Every event.
    All,
}

/// External delivery callback, e.g. a real-time transport.
///
/// Called synchronously, at most once per event, from whichever worker
/// produced the event and while that job's record is locked. It must return
/// quickly and must not call back into the orchestrator.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn deliver(&self, event: &JobEvent);
}

impl<F> EventSink for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn deliver(&self, event: &JobEvent) {
        self(event);
    }
}

/// One broadcast channel per subscribed key.
#[derive(Debug)]
struct Channel {
    /// Distinguishes a channel from one recreated under the same key.
    id: u64,
    sender: broadcast::Sender<JobEvent>,
}

type Channels = DashMap<EventKey, Channel>;

/// Multi-subscriber event bus.
///
/// A key's channel exists only while it has subscribers.
pub struct EventBus {
    channels: Arc<Channels>,
    next_channel: AtomicU64,
    buffer: usize,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Create a bus giving each subscriber a buffer of `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_channel: AtomicU64::new(0),
            buffer: buffer.max(1),
            sink: RwLock::new(None),
        }
    }

    /// Publish an event. Never blocks.
    pub fn publish(&self, event: &JobEvent) {
        self.send(&EventKey::Job(event.job_id.clone()), event);
        self.send(&EventKey::Target(event.target_id.clone()), event);
        self.send(&EventKey::All, event);

        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }

    fn send(&self, key: &EventKey, event: &JobEvent) {
        let abandoned = match self.channels.get(key) {
            Some(channel) => channel.sender.send(event.clone()).is_err(),
            None => return,
        };

        if abandoned {
            // Every receiver is gone; drop the channel unless someone
            // subscribed in the meantime.
            self.channels
                .remove_if(key, |_, channel| channel.sender.receiver_count() == 0);
        }
    }

    /// Subscribe to events matching `key`.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self, key: EventKey) -> Subscription {
        let (channel, receiver) = {
            let channel = self.channels.entry(key.clone()).or_insert_with(|| Channel {
                id: self.next_channel.fetch_add(1, Ordering::Relaxed),
                sender: broadcast::channel(self.buffer).0,
            });
            (channel.id, channel.sender.subscribe())
        };
        debug!(key = ?key, "event subscriber added");
        Subscription {
            key,
            channel,
            channels: Arc::downgrade(&self.channels),
            receiver,
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(EventKey::All)
    }

    /// Number of subscribers currently attached to `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &EventKey) -> usize {
        self.channels
            .get(key)
            .map_or(0, |channel| channel.sender.receiver_count())
    }

    /// Number of keys that currently have a channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Register the external sink.
    ///
    /// Only one sink may be registered at a time.
    pub fn register_sink(&self, sink: Arc<dyn EventSink>) -> OrchestratorResult<()> {
        let mut slot = self.sink.write();
        if slot.is_some() {
            return Err(OrchestratorError::SinkAlreadyRegistered);
        }
        *slot = Some(sink);
        Ok(())
    }

    /// Remove the external sink, returning it.
    pub fn unregister_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.write().take()
    }

    /// Whether an external sink is registered.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    /// End every subscription once its buffered events are consumed.
    pub fn close(&self) {
        self.channels.clear();
        self.sink.write().take();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channel_count())
            .field("buffer", &self.buffer)
            .field("has_sink", &self.has_sink())
            .finish()
    }
}

/// A lazy, unbounded sequence of events for one key.
///
/// Ends when dropped or when the bus closes. Re-subscribing starts fresh.
#[derive(Debug)]
pub struct Subscription {
    key: EventKey,
    channel: u64,
    channels: Weak<Channels>,
    receiver: broadcast::Receiver<JobEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        // Our receiver is still counted until this returns.
        let removed = channels.remove_if(&self.key, |_, channel| {
            channel.id == self.channel && channel.sender.receiver_count() <= 1
        });
        if removed.is_some() {
            debug!(key = ?self.key, "event channel removed");
        }
    }
}

impl Subscription {
    /// The key this subscription listens on.
    #[must_use]
    pub const fn key(&self) -> &EventKey {
        &self.key
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = ?self.key, skipped, "event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(key = ?self.key, skipped, "event subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}
