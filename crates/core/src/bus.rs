// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topic-keyed event bus
//!
//! Fan-out primitive tying the supervisor, proxy fleet, and telemetry store
//! together. Dispatch is asynchronous but ordered within a topic: each topic
//! owns a bounded queue drained by a dedicated worker task, so handlers for
//! events of the same topic observe them in publish order. No cross-topic
//! ordering is guaranteed.
//!
//! Queue-full policy: low-priority topics (`log.line`, `mcp.activity`,
//! `proxy.request`) drop their oldest queued event; high-priority topics wait
//! briefly for space and then drop the new event. `publish` never blocks on a
//! slow handler beyond that bounded wait.

use crate::event::{Event, Topic, TopicPriority};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Handler invoked for each event of a subscribed topic.
///
/// Handlers run on the topic's worker task, never on the publisher's.
/// Long-running subscribers should forward into their own channel.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Default per-topic queue capacity.
const DEFAULT_QUEUE_CAP: usize = 1_000;

/// How long a high-priority publish waits for queue space before dropping.
const FULL_QUEUE_WAIT: Duration = Duration::from_millis(50);

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is shut down")]
    Shutdown,
}

/// Handle returned by `subscribe`; pass to `unsubscribe` to detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: Topic,
    id: u64,
}

/// Counters for bus health. All monotonic except queue depth.
#[derive(Default)]
struct BusMetrics {
    published: AtomicU64,
    dropped: AtomicU64,
    handler_panics: AtomicU64,
}

/// Point-in-time snapshot of bus metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub handler_panics: u64,
    pub queue_depth: u64,
}

struct TopicState {
    /// Copy-on-write handler list: subscribes are rare, dispatch is hot.
    handlers: RwLock<Arc<Vec<(u64, Handler)>>>,
    queue: Mutex<VecDeque<Event>>,
    /// Signalled when the queue gains an event.
    arrived: Notify,
    /// Signalled when the queue frees a slot.
    space: Notify,
}

impl TopicState {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
            queue: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            space: Notify::new(),
        }
    }
}

struct BusInner {
    topics: RwLock<HashMap<Topic, Arc<TopicState>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    next_sub_id: AtomicU64,
    queue_cap: usize,
    shutdown: CancellationToken,
    metrics: BusMetrics,
}

/// Topic-keyed fan-out bus. Cheap to clone; all clones share state.
///
/// Must be created inside a tokio runtime: each topic spawns a worker task
/// the first time it is subscribed to or published on.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_cap(DEFAULT_QUEUE_CAP)
    }

    /// Bus with a custom per-topic queue capacity (tests exercise overflow).
    pub fn with_queue_cap(queue_cap: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(1),
                queue_cap,
                shutdown: CancellationToken::new(),
                metrics: BusMetrics::default(),
            }),
        }
    }

    /// Register a handler for a topic. Events already queued before the
    /// subscription are not replayed.
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let state = self.topic_state(&topic);
        {
            let mut guard = state.handlers.write();
            let mut next: Vec<(u64, Handler)> = guard.as_ref().clone();
            next.push((id, handler));
            *guard = Arc::new(next);
        }
        Subscription { topic, id }
    }

    /// Detach a previously registered handler. Events already queued may
    /// still be delivered to it.
    pub fn unsubscribe(&self, sub: &Subscription) {
        let topics = self.inner.topics.read();
        if let Some(state) = topics.get(&sub.topic) {
            let mut guard = state.handlers.write();
            let next: Vec<(u64, Handler)> =
                guard.as_ref().iter().filter(|(id, _)| *id != sub.id).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    /// Publish an event. Best-effort: on a full queue the event (or the
    /// oldest queued one, for low-priority topics) is dropped and counted.
    /// Returns an error only after shutdown.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Shutdown);
        }
        let priority = event.topic.priority();
        let state = self.topic_state(&event.topic);

        let mut event = Some(event);
        loop {
            {
                let mut queue = state.queue.lock();
                if queue.len() < self.inner.queue_cap {
                    if let Some(ev) = event.take() {
                        queue.push_back(ev);
                    }
                    drop(queue);
                    self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
                    state.arrived.notify_one();
                    return Ok(());
                }
                if priority == TopicPriority::Low {
                    // Drop-oldest keeps the stream fresh under pressure.
                    queue.pop_front();
                    if let Some(ev) = event.take() {
                        queue.push_back(ev);
                    }
                    drop(queue);
                    self.inner.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
                    state.arrived.notify_one();
                    return Ok(());
                }
            }
            // High priority: wait briefly for the worker to free a slot.
            let waited =
                tokio::time::timeout(FULL_QUEUE_WAIT, state.space.notified()).await;
            if waited.is_err() {
                self.inner.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %state_topic_name(&event), "event queue full, dropping");
                return Ok(());
            }
        }
    }

    /// Snapshot the bus counters.
    pub fn metrics(&self) -> BusMetricsSnapshot {
        let queue_depth: usize =
            self.inner.topics.read().values().map(|s| s.queue.lock().len()).sum();
        BusMetricsSnapshot {
            published: self.inner.metrics.published.load(Ordering::Relaxed),
            dropped: self.inner.metrics.dropped.load(Ordering::Relaxed),
            handler_panics: self.inner.metrics.handler_panics.load(Ordering::Relaxed),
            queue_depth: queue_depth as u64,
        }
    }

    /// Stop intake, drain queued events, and wait for workers with a
    /// deadline. Stragglers past the deadline are abandoned.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.shutdown.cancel();
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            if tokio::time::timeout(deadline, worker).await.is_err() {
                warn!("event bus worker did not drain before deadline");
            }
        }
    }

    fn topic_state(&self, topic: &Topic) -> Arc<TopicState> {
        if let Some(state) = self.inner.topics.read().get(topic) {
            return Arc::clone(state);
        }
        let mut topics = self.inner.topics.write();
        if let Some(state) = topics.get(topic) {
            return Arc::clone(state);
        }
        let state = Arc::new(TopicState::new());
        topics.insert(topic.clone(), Arc::clone(&state));
        let handle = tokio::spawn(run_worker(topic.clone(), Arc::clone(&state), self.clone()));
        self.inner.workers.lock().push(handle);
        state
    }

    /// Best-effort synchronous enqueue of an `internal.error` event from a
    /// worker context. Never blocks; on a full queue the report is dropped
    /// and counted.
    fn report_internal(&self, event: Event) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let state = self.topic_state(&Topic::InternalError);
        let mut queue = state.queue.lock();
        if queue.len() < self.inner.queue_cap {
            queue.push_back(event);
            drop(queue);
            self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
            state.arrived.notify_one();
        } else {
            self.inner.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn state_topic_name(event: &Option<Event>) -> &str {
    event.as_ref().map(|e| e.topic.as_str()).unwrap_or("?")
}

/// Per-topic worker: drains the queue in order, invoking every handler with
/// a panic boundary so one handler's failure does not affect siblings.
async fn run_worker(topic: Topic, state: Arc<TopicState>, bus: EventBus) {
    loop {
        drain(&topic, &state, &bus);
        tokio::select! {
            _ = state.arrived.notified() => {}
            _ = bus.inner.shutdown.cancelled() => {
                drain(&topic, &state, &bus);
                return;
            }
        }
    }
}

fn drain(topic: &Topic, state: &TopicState, bus: &EventBus) {
    loop {
        let event = { state.queue.lock().pop_front() };
        let Some(event) = event else { return };
        state.space.notify_one();

        let handlers = Arc::clone(&state.handlers.read());
        for (id, handler) in handlers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                bus.inner.metrics.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, subscription = id, "event handler panicked");
                // A panicking internal.error handler must not report into
                // its own topic.
                if *topic != Topic::InternalError {
                    bus.report_internal(
                        Event::new(Topic::InternalError)
                            .with("kind", "handler_panic")
                            .with("topic", topic.as_str())
                            .with("subscription", *id),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
