// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem instance rendezvous
//!
//! Each instance writes `<dir>/<instanceID>.json` atomically (temp file +
//! rename) on start, refreshes `lastPing` on an interval, and deletes the
//! file on clean shutdown. Readers watch the directory with `notify` plus a
//! periodic rescan, culling records whose owner PID is dead or whose ping
//! is stale.

use brum_core::InstanceId;
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// On-disk self-registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub directory: PathBuf,
    /// RPC port of the instance.
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub process_info: ProcessInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
}

impl InstanceRecord {
    pub fn new(id: InstanceId, name: &str, directory: &Path, port: u16) -> Self {
        let pid = std::process::id();
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            directory: directory.to_path_buf(),
            port,
            pid,
            started_at: now,
            last_ping: now,
            process_info: ProcessInfo { pid },
        }
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("rendezvous io: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Timings for registration refresh and watching.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub ping_interval: Duration,
    pub rescan_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Write a record atomically so readers never observe a partial file.
fn write_record(dir: &Path, record: &InstanceRecord) -> Result<(), RendezvousError> {
    std::fs::create_dir_all(dir)?;
    let body = serde_json::to_vec_pretty(record)?;
    let tmp = dir.join(format!(".{}.tmp", record.id));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, dir.join(record.file_name()))?;
    Ok(())
}

/// A live self-registration: keeps `lastPing` fresh until deregistered.
pub struct InstanceRegistration {
    dir: PathBuf,
    record: InstanceRecord,
    cancel: CancellationToken,
}

impl InstanceRegistration {
    /// Register this process in the rendezvous directory and start the ping
    /// refresher. Must be called inside a tokio runtime.
    pub fn register(
        dir: &Path,
        record: InstanceRecord,
        config: &RendezvousConfig,
    ) -> Result<Self, RendezvousError> {
        write_record(dir, &record)?;
        info!(instance = %record.id, dir = %dir.display(), "instance registered");

        let cancel = CancellationToken::new();
        let refresher_cancel = cancel.clone();
        let refresher_dir = dir.to_path_buf();
        let mut refresher_record = record.clone();
        let interval = config.ping_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        refresher_record.last_ping = Utc::now();
                        if let Err(e) = write_record(&refresher_dir, &refresher_record) {
                            warn!(error = %e, "rendezvous ping refresh failed");
                        }
                    }
                    _ = refresher_cancel.cancelled() => return,
                }
            }
        });

        Ok(Self { dir: dir.to_path_buf(), record, cancel })
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    /// Delete the registration file. Crashed instances skip this and are
    /// culled by readers instead.
    pub fn deregister(self) {
        self.cancel.cancel();
        let path = self.dir.join(self.record.file_name());
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(error = %e, "rendezvous file already gone");
        }
        info!(instance = %self.record.id, "instance deregistered");
    }
}

/// Change observed in the rendezvous directory.
#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    Added(InstanceRecord),
    Updated(InstanceRecord),
    Removed(InstanceId),
}

/// Directory watcher: `notify` events plus a fallback periodic rescan.
pub struct RendezvousWatcher {
    cancel: CancellationToken,
}

impl RendezvousWatcher {
    /// Start watching. Events arrive on the returned channel; the watcher
    /// stops when the handle is dropped or `stop` is called.
    pub fn spawn(
        dir: &Path,
        config: RendezvousConfig,
    ) -> Result<(Self, mpsc::Receiver<RendezvousEvent>), RendezvousError> {
        std::fs::create_dir_all(dir)?;
        let (event_tx, event_rx) = mpsc::channel(64);
        let (wake_tx, wake_rx) = mpsc::channel::<()>(4);

        // The notify callback runs on its own thread; it only wakes the
        // scan task, which does all parsing and diffing.
        let notify_tx = wake_tx.clone();
        let watcher = notify::recommended_watcher(move |result| {
            if let Ok(notify::Event { .. }) = result {
                let _ = notify_tx.try_send(());
            }
        });
        let watcher = match watcher {
            Ok(mut w) => match w.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => Some(w),
                Err(e) => {
                    warn!(error = %e, "directory watch failed, falling back to rescan only");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "file watcher unavailable, falling back to rescan only");
                None
            }
        };

        let cancel = CancellationToken::new();
        tokio::spawn(run_scanner(
            dir.to_path_buf(),
            config,
            event_tx,
            wake_rx,
            watcher,
            cancel.clone(),
        ));
        Ok((Self { cancel }, event_rx))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RendezvousWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_scanner(
    dir: PathBuf,
    config: RendezvousConfig,
    event_tx: mpsc::Sender<RendezvousEvent>,
    mut wake_rx: mpsc::Receiver<()>,
    _watcher: Option<notify::RecommendedWatcher>,
    cancel: CancellationToken,
) {
    let mut known: HashMap<InstanceId, InstanceRecord> = HashMap::new();
    let mut rescan = tokio::time::interval(config.rescan_interval);
    rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = rescan.tick() => {}
            _ = wake_rx.recv() => {}
            _ = cancel.cancelled() => return,
        }

        let current = scan_dir(&dir, &config);
        // Diff against the known set.
        for (id, record) in &current {
            match known.get(id) {
                None => {
                    if event_tx.send(RendezvousEvent::Added(record.clone())).await.is_err() {
                        return;
                    }
                }
                Some(previous) if previous != record => {
                    if event_tx.send(RendezvousEvent::Updated(record.clone())).await.is_err() {
                        return;
                    }
                }
                Some(_) => {}
            }
        }
        let removed: Vec<InstanceId> =
            known.keys().filter(|id| !current.contains_key(*id)).cloned().collect();
        for id in removed {
            if event_tx.send(RendezvousEvent::Removed(id)).await.is_err() {
                return;
            }
        }
        known = current;
    }
}

/// Read every record in the directory, culling stale or invalid files.
fn scan_dir(dir: &Path, config: &RendezvousConfig) -> HashMap<InstanceId, InstanceRecord> {
    let mut records = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "rendezvous dir unreadable");
            return records;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let record = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|body| serde_json::from_str::<InstanceRecord>(&body).ok())
        {
            Some(record) => record,
            None => {
                debug!(file = %path.display(), "unparseable rendezvous file ignored");
                continue;
            }
        };
        if !record_is_live(&record, config) {
            debug!(instance = %record.id, "stale rendezvous record culled");
            let _ = std::fs::remove_file(&path);
            continue;
        }
        records.insert(record.id.clone(), record);
    }
    records
}

fn record_is_live(record: &InstanceRecord, config: &RendezvousConfig) -> bool {
    let age = Utc::now().signed_duration_since(record.last_ping);
    if age.num_milliseconds() > config.stale_threshold.as_millis() as i64 {
        return false;
    }
    pid_alive(record.pid)
}

/// Probe a PID with signal 0. EPERM still means the process exists.
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "rendezvous_tests.rs"]
mod tests;
