// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-keyed telemetry aggregation with bounded retention

use crate::types::{
    PageSession, StoredEvent, TelemetryBatch, TelemetryEventType,
};
use crate::UNKNOWN_PROCESS;
use brum_core::{Clock, SessionId, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Resolves which supervised process serves a given URL. Implemented by the
/// proxy fleet; the telemetry store only sees this abstraction.
pub trait ProcessResolver: Send + Sync {
    fn lookup_process_for_url(&self, url: &str) -> Option<String>;
}

/// Retention bounds and timeouts.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub session_idle_timeout: Duration,
    pub max_sessions_per_process: usize,
    pub max_events_per_session: usize,
    pub max_memory_snapshots: usize,
    pub max_session_id_len: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30 * 60),
            max_sessions_per_process: 100,
            max_events_per_session: 1_000,
            max_memory_snapshots: 20,
            max_session_id_len: 128,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("batch has no session id")]
    MissingSession,
}

/// In-memory session store. Cheap to clone; all clones share state.
pub struct TelemetryStore<C: Clock = SystemClock> {
    sessions: Arc<RwLock<HashMap<SessionId, PageSession>>>,
    resolver: Arc<RwLock<Option<Arc<dyn ProcessResolver>>>>,
    config: TelemetryConfig,
    clock: C,
}

impl<C: Clock> Clone for TelemetryStore<C> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            resolver: Arc::clone(&self.resolver),
            config: self.config.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl TelemetryStore<SystemClock> {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TelemetryStore<C> {
    pub fn with_clock(config: TelemetryConfig, clock: C) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            resolver: Arc::new(RwLock::new(None)),
            config,
            clock,
        }
    }

    /// Install the URL→process resolver (the proxy fleet). Used to place
    /// sessions whose caller could not resolve a process name.
    pub fn set_resolver(&self, resolver: Arc<dyn ProcessResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    /// Ingest one batch. `process_name` is the caller's resolution of
    /// `metadata.url` (the proxy's URL table); when the caller passes
    /// unknown, the installed resolver gets a try before the session is
    /// written. A session already bound to a real process is never
    /// downgraded back to unknown.
    ///
    /// Returns a snapshot of the session after ingestion.
    pub fn add_batch(
        &self,
        batch: TelemetryBatch,
        process_name: &str,
    ) -> Result<PageSession, TelemetryError> {
        if batch.session_id.is_empty() {
            return Err(TelemetryError::MissingSession);
        }
        let mut raw_id = batch.session_id;
        if raw_id.len() > self.config.max_session_id_len {
            raw_id.truncate(self.config.max_session_id_len);
        }
        let session_id = SessionId::new(raw_id);
        let now = self.clock.epoch_ms();

        // Resolve outside the sessions lock: the resolver reads proxy state
        // and the lock order is proxy before telemetry.
        let mut process_name = process_name.to_string();
        if process_name.is_empty() || process_name == UNKNOWN_PROCESS {
            let resolver = { self.resolver.read().clone() };
            if let (Some(resolver), Some(url)) = (resolver, batch.metadata.url.as_deref()) {
                if let Some(resolved) = resolver.lookup_process_for_url(url) {
                    process_name = resolved;
                }
            }
        }
        let process_name = process_name.as_str();

        let snapshot = {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(session_id.clone()).or_insert_with(|| {
                PageSession::new(
                    session_id.clone(),
                    batch.metadata.url.clone().unwrap_or_default(),
                    UNKNOWN_PROCESS.to_string(),
                    now,
                )
            });

            if session.process_name == UNKNOWN_PROCESS
                && !process_name.is_empty()
                && process_name != UNKNOWN_PROCESS
            {
                session.process_name = process_name.to_string();
            }
            if let Some(url) = &batch.metadata.url {
                if !url.is_empty() {
                    session.url = url.clone();
                }
            }

            for event in batch.events {
                if let Some(url) = &event.url {
                    if !url.is_empty() {
                        session.url = url.clone();
                    }
                }
                match event.kind {
                    TelemetryEventType::PerformanceMetrics => {
                        if session.performance.is_none() {
                            session.performance = Some(event.data.clone());
                        }
                    }
                    TelemetryEventType::MemoryUsage => {
                        session.memory_snapshots.push_back(event.data.clone());
                        while session.memory_snapshots.len() > self.config.max_memory_snapshots {
                            session.memory_snapshots.pop_front();
                        }
                    }
                    TelemetryEventType::JavascriptError
                    | TelemetryEventType::UnhandledRejection => {
                        session.error_count += 1;
                    }
                    TelemetryEventType::UserInteraction => {
                        session.interaction_count += 1;
                    }
                    TelemetryEventType::ConsoleOutput => {
                        let level = event
                            .data
                            .get("level")
                            .and_then(|v| v.as_str())
                            .unwrap_or("log")
                            .to_string();
                        *session.console_counts.entry(level).or_insert(0) += 1;
                    }
                    _ => {}
                }
                if session.events.len() < self.config.max_events_per_session {
                    session.events.push(StoredEvent { event, received_at_ms: now });
                }
            }

            session.last_activity_ms = now;
            session.clone()
        };

        self.reap(now);
        Ok(snapshot)
    }

    /// Deep-copied snapshot of one session.
    pub fn get_session(&self, id: &str) -> Option<PageSession> {
        self.sessions.read().get(id).cloned()
    }

    /// Sessions owned by a process, most recently active first.
    pub fn sessions_for_process(&self, process_name: &str) -> Vec<PageSession> {
        let mut sessions: Vec<PageSession> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.process_name == process_name)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        sessions
    }

    /// Sessions whose current URL matches, most recently active first.
    pub fn sessions_for_url(&self, url: &str) -> Vec<PageSession> {
        let mut sessions: Vec<PageSession> =
            self.sessions.read().values().filter(|s| s.url == url).cloned().collect();
        sessions.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        sessions
    }

    pub fn all_sessions(&self) -> Vec<PageSession> {
        let mut sessions: Vec<PageSession> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        sessions
    }

    pub fn clear_sessions_for_process(&self, process_name: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.process_name != process_name);
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop idle sessions and cap per-process counts, oldest out first.
    /// Invoked opportunistically after every ingest.
    fn reap(&self, now_ms: u64) {
        let idle_ms = self.config.session_idle_timeout.as_millis() as u64;
        let mut sessions = self.sessions.write();

        let before = sessions.len();
        sessions.retain(|_, s| now_ms.saturating_sub(s.last_activity_ms) <= idle_ms);
        let reaped = before - sessions.len();
        if reaped > 0 {
            debug!(reaped, "idle telemetry sessions dropped");
        }

        let mut per_process: HashMap<String, Vec<(SessionId, u64)>> = HashMap::new();
        for session in sessions.values() {
            per_process
                .entry(session.process_name.clone())
                .or_default()
                .push((session.session_id.clone(), session.last_activity_ms));
        }
        for (_, mut owned) in per_process {
            if owned.len() <= self.config.max_sessions_per_process {
                continue;
            }
            owned.sort_by_key(|(_, last)| *last);
            let excess = owned.len() - self.config.max_sessions_per_process;
            for (id, _) in owned.into_iter().take(excess) {
                sessions.remove(&id);
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
