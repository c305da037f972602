// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded in-memory log store
//!
//! A single worker task owns the arrays; every public method is a
//! request/response message over a bounded channel. There is no synchronous
//! fallback path: callers either get a response within the per-operation
//! timeout or an overload error, so intake order is the only order.

use crate::url_detect::UrlPatterns;
use brum_core::{Clock, LogEntry, LogLevel, ProcessId, SystemClock, UrlEntry};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Tuning knobs for the store. Defaults match production behavior.
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Total retained entries; oldest evicted beyond this.
    pub max_entries: usize,
    /// Bounded side list of error entries.
    pub max_errors: usize,
    /// Bounded side list of discovered URLs.
    pub max_urls: usize,
    /// Content truncation length in characters.
    pub max_content_len: usize,
    /// How long a caller waits for the worker before `Overloaded`.
    pub op_timeout: Duration,
    /// Intake channel capacity.
    pub intake_cap: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_errors: 500,
            max_urls: 100,
            max_content_len: 2_048,
            op_timeout: Duration::from_millis(500),
            intake_cap: 1_000,
        }
    }
}

/// Errors surfaced to log store callers.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// The worker did not respond within the operation timeout.
    #[error("log store overloaded")]
    Overloaded,
    /// The worker has shut down.
    #[error("log store closed")]
    Closed,
}

/// Input for a single new entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub process_id: ProcessId,
    pub process_name: String,
    pub content: String,
    pub is_error: bool,
}

enum Command {
    Add(NewEntry, oneshot::Sender<LogEntry>),
    AddBatch(Vec<NewEntry>, oneshot::Sender<Vec<LogEntry>>),
    ByProcess(ProcessId, oneshot::Sender<Vec<LogEntry>>),
    All(oneshot::Sender<Vec<LogEntry>>),
    Search(String, oneshot::Sender<Vec<LogEntry>>),
    Errors(oneshot::Sender<Vec<LogEntry>>),
    Urls(oneshot::Sender<Vec<UrlEntry>>),
    Clear(oneshot::Sender<()>),
    ClearProcess(ProcessId, oneshot::Sender<usize>),
}

/// Handle to the store. Cheap to clone; all clones talk to one worker.
#[derive(Clone)]
pub struct LogStore {
    tx: mpsc::Sender<Command>,
    op_timeout: Duration,
}

/// Owns the worker task; the daemon joins it last during shutdown so tail
/// log lines are not lost.
pub struct LogStoreWorker {
    handle: tokio::task::JoinHandle<()>,
}

impl LogStoreWorker {
    /// Wait for the worker to drain and exit. The worker exits once every
    /// `LogStore` clone has been dropped.
    pub async fn join(self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.handle).await.is_err() {
            tracing::warn!("log store worker did not drain before deadline");
        }
    }
}

impl LogStore {
    /// Spawn the owning worker. Must be called inside a tokio runtime.
    pub fn spawn(config: LogStoreConfig) -> (Self, LogStoreWorker) {
        Self::spawn_with_clock(config, SystemClock)
    }

    pub fn spawn_with_clock<C: Clock>(
        config: LogStoreConfig,
        clock: C,
    ) -> (Self, LogStoreWorker) {
        let (tx, rx) = mpsc::channel(config.intake_cap);
        let op_timeout = config.op_timeout;
        let handle = tokio::spawn(run_worker(Store::new(config, clock), rx));
        (Self { tx, op_timeout }, LogStoreWorker { handle })
    }

    /// Append one line. The entry comes back with its assigned ID, detected
    /// level, and truncated content.
    pub async fn add(
        &self,
        process_id: impl Into<ProcessId>,
        process_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Result<LogEntry, LogStoreError> {
        let entry = NewEntry {
            process_id: process_id.into(),
            process_name: process_name.into(),
            content: content.into(),
            is_error,
        };
        self.request(|reply| Command::Add(entry, reply)).await
    }

    /// Append many lines in one worker round-trip. IDs in the returned
    /// entries are strictly increasing.
    pub async fn add_batch(&self, entries: Vec<NewEntry>) -> Result<Vec<LogEntry>, LogStoreError> {
        self.request(|reply| Command::AddBatch(entries, reply)).await
    }

    pub async fn by_process(
        &self,
        id: impl Into<ProcessId>,
    ) -> Result<Vec<LogEntry>, LogStoreError> {
        let id = id.into();
        self.request(|reply| Command::ByProcess(id, reply)).await
    }

    pub async fn all(&self) -> Result<Vec<LogEntry>, LogStoreError> {
        self.request(Command::All).await
    }

    /// Case-insensitive substring search over content and process name.
    pub async fn search(&self, query: impl Into<String>) -> Result<Vec<LogEntry>, LogStoreError> {
        let query = query.into();
        self.request(|reply| Command::Search(query, reply)).await
    }

    pub async fn errors(&self) -> Result<Vec<LogEntry>, LogStoreError> {
        self.request(Command::Errors).await
    }

    pub async fn urls(&self) -> Result<Vec<UrlEntry>, LogStoreError> {
        self.request(Command::Urls).await
    }

    pub async fn clear(&self) -> Result<(), LogStoreError> {
        self.request(Command::Clear).await
    }

    /// Remove all entries for one process; returns how many were dropped.
    pub async fn clear_process(
        &self,
        id: impl Into<ProcessId>,
    ) -> Result<usize, LogStoreError> {
        let id = id.into();
        self.request(|reply| Command::ClearProcess(id, reply)).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LogStoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = make(reply_tx);
        let send = tokio::time::timeout(self.op_timeout, self.tx.send(cmd));
        match send.await {
            Err(_) => return Err(LogStoreError::Overloaded),
            Ok(Err(_)) => return Err(LogStoreError::Closed),
            Ok(Ok(())) => {}
        }
        match tokio::time::timeout(self.op_timeout, reply_rx).await {
            Err(_) => Err(LogStoreError::Overloaded),
            Ok(Err(_)) => Err(LogStoreError::Closed),
            Ok(Ok(value)) => Ok(value),
        }
    }
}

struct Store<C: Clock> {
    config: LogStoreConfig,
    clock: C,
    entries: VecDeque<LogEntry>,
    by_process: HashMap<ProcessId, Vec<u64>>,
    errors: VecDeque<LogEntry>,
    urls: Vec<UrlEntry>,
    next_id: u64,
    level_error: Regex,
    level_warn: Regex,
    level_debug: Regex,
    url_patterns: UrlPatterns,
}

impl<C: Clock> Store<C> {
    fn new(config: LogStoreConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            entries: VecDeque::new(),
            by_process: HashMap::new(),
            errors: VecDeque::new(),
            urls: Vec::new(),
            next_id: 1,
            level_error: level_pattern(r"(?i)\b(error|fatal|panic|exception|fail(ed|ure)?)\b|\[(ERROR|FATAL)\]"),
            level_warn: level_pattern(r"(?i)\b(warn(ing)?|deprecated)\b|\[WARN\]"),
            level_debug: level_pattern(r"(?i)\b(debug|trace|verbose)\b|\[(DEBUG|TRACE)\]"),
            url_patterns: UrlPatterns::new(),
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Add(new, reply) => {
                let entry = self.insert(new);
                let _ = reply.send(entry);
            }
            Command::AddBatch(batch, reply) => {
                let entries = batch.into_iter().map(|new| self.insert(new)).collect();
                let _ = reply.send(entries);
            }
            Command::ByProcess(id, reply) => {
                let entries =
                    self.entries.iter().filter(|e| e.process_id == id).cloned().collect();
                let _ = reply.send(entries);
            }
            Command::All(reply) => {
                let _ = reply.send(self.entries.iter().cloned().collect());
            }
            Command::Search(query, reply) => {
                let needle = query.to_lowercase();
                let entries = self
                    .entries
                    .iter()
                    .filter(|e| {
                        e.content.to_lowercase().contains(&needle)
                            || e.process_name.to_lowercase().contains(&needle)
                    })
                    .cloned()
                    .collect();
                let _ = reply.send(entries);
            }
            Command::Errors(reply) => {
                let _ = reply.send(self.errors.iter().cloned().collect());
            }
            Command::Urls(reply) => {
                let _ = reply.send(self.urls.clone());
            }
            Command::Clear(reply) => {
                self.entries.clear();
                self.by_process.clear();
                self.errors.clear();
                self.urls.clear();
                let _ = reply.send(());
            }
            Command::ClearProcess(id, reply) => {
                let before = self.entries.len();
                self.entries.retain(|e| e.process_id != id);
                self.errors.retain(|e| e.process_id != id);
                self.by_process.remove(&id);
                let _ = reply.send(before - self.entries.len());
            }
        }
    }

    fn insert(&mut self, new: NewEntry) -> LogEntry {
        let id = self.next_id;
        self.next_id += 1;

        let mut content = new.content;
        if content.chars().count() > self.config.max_content_len {
            content = content.chars().take(self.config.max_content_len).collect();
        }

        let level = self.detect_level(&content, new.is_error);
        let is_error = new.is_error || level == LogLevel::Error;

        let mut tags = BTreeSet::new();
        let detection = self.url_patterns.detect(&content);
        if let Some(detection) = &detection {
            tags.insert("url".to_string());
            if let Some(hint) = &detection.framework_hint {
                tags.insert(hint.clone());
            }
        }

        let entry = LogEntry {
            id,
            process_id: new.process_id.clone(),
            process_name: new.process_name,
            timestamp_ms: self.clock.epoch_ms(),
            content,
            is_error,
            level,
            tags,
        };

        self.by_process.entry(new.process_id).or_default().push(id);
        if is_error {
            self.errors.push_back(entry.clone());
            if self.errors.len() > self.config.max_errors {
                self.errors.pop_front();
            }
        }
        if let Some(detection) = detection {
            self.record_url(&entry, detection);
        }

        self.entries.push_back(entry.clone());
        if self.entries.len() > self.config.max_entries {
            if let Some(evicted) = self.entries.pop_front() {
                if let Some(ids) = self.by_process.get_mut(&evicted.process_id) {
                    if ids.first() == Some(&evicted.id) {
                        ids.remove(0);
                    } else {
                        ids.retain(|i| *i != evicted.id);
                    }
                    if ids.is_empty() {
                        self.by_process.remove(&evicted.process_id);
                    }
                }
            }
        }

        entry
    }

    fn detect_level(&self, content: &str, is_error: bool) -> LogLevel {
        if is_error || self.level_error.is_match(content) {
            LogLevel::Error
        } else if self.level_warn.is_match(content) {
            LogLevel::Warn
        } else if self.level_debug.is_match(content) {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    fn record_url(&mut self, entry: &LogEntry, detection: crate::url_detect::UrlDetection) {
        let now = entry.timestamp_ms;
        if let Some(existing) = self.urls.iter_mut().find(|u| u.url == detection.url) {
            existing.last_seen_ms = now;
            return;
        }
        self.urls.push(UrlEntry {
            url: detection.url,
            detected_in: entry.process_id.clone(),
            first_seen_ms: now,
            last_seen_ms: now,
            framework_hint: detection.framework_hint,
        });
        if self.urls.len() > self.config.max_urls {
            self.urls.remove(0);
        }
    }
}

/// Compile a fixed level-detection pattern.
#[allow(clippy::unwrap_used)]
fn level_pattern(expr: &str) -> Regex {
    Regex::new(expr).unwrap()
}

async fn run_worker<C: Clock>(mut store: Store<C>, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        store.handle(cmd);
    }
    debug!("log store worker drained");
}

#[cfg(test)]
#[path = "log_store_tests.rs"]
mod tests;
