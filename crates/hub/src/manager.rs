// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub connection manager
//!
//! One actor per discovered instance owns that instance's connection state
//! and processes commands from its inbox; there is no cross-instance lock.
//! The manager routes external sessions to instances and snapshots actor
//! state through actor-owned shared slots.

use crate::client::{HubError, RpcClient};
use crate::rendezvous::{InstanceRecord, RendezvousEvent};
use brum_core::InstanceId;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection lifecycle. `Dead` is absorbing unless the rendezvous file
/// reappears with a newer start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Active,
    Retrying,
    Dead,
}

/// Timings and limits for the per-instance state machine.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive probe failures before leaving Active.
    pub probe_failures: u32,
    /// Routed tool-call failures within one probe window that mark the
    /// window unhealthy even when the probe itself answers.
    pub call_failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Connection attempts before Dead.
    pub max_retries: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_failures: 2,
            call_failure_threshold: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Snapshot of one connection for display and dispatch decisions.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub instance_id: InstanceId,
    pub name: String,
    pub port: u16,
    pub state: ConnectionState,
    pub retry_count: u32,
    /// Routed tool-call failures since the last healthy probe window.
    pub call_failures: u64,
    pub last_activity_ms: u64,
    /// External RPC sessions currently routed to this instance.
    pub sessions: Vec<String>,
}

enum ActorCmd {
    RendezvousUpdate(InstanceRecord),
    Removed,
}

/// Actor-owned shared state the manager reads without messaging.
struct ActorShared {
    info: RwLock<ConnectionInfo>,
    client: RwLock<Option<Arc<RpcClient>>>,
    /// Call failures observed by the router, consumed at each probe window.
    /// Crossing the threshold marks the window unhealthy.
    call_failures: AtomicU64,
}

struct ActorHandle {
    tx: mpsc::Sender<ActorCmd>,
    shared: Arc<ActorShared>,
    task: tokio::task::JoinHandle<()>,
}

/// The hub's connection registry. Cheap to clone.
#[derive(Clone)]
pub struct HubManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: HubConfig,
    actors: RwLock<IndexMap<InstanceId, ActorHandle>>,
    sessions: RwLock<HashMap<String, InstanceId>>,
}

impl HubManager {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                actors: RwLock::new(IndexMap::new()),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Feed one rendezvous change into the right actor. Two watchers may
    /// report the same file; the first Added wins and later ones become
    /// updates.
    pub fn handle_rendezvous_event(&self, event: RendezvousEvent) {
        match event {
            RendezvousEvent::Added(record) => {
                let mut actors = self.inner.actors.write();
                if let Some(existing) = actors.get(&record.id) {
                    let _ = existing.tx.try_send(ActorCmd::RendezvousUpdate(record));
                    return;
                }
                let id = record.id.clone();
                let handle = spawn_actor(record, self.inner.config.clone());
                actors.insert(id, handle);
            }
            RendezvousEvent::Updated(record) => {
                let actors = self.inner.actors.read();
                if let Some(actor) = actors.get(&record.id) {
                    let _ = actor.tx.try_send(ActorCmd::RendezvousUpdate(record));
                } else {
                    drop(actors);
                    self.handle_rendezvous_event(RendezvousEvent::Added(record));
                }
            }
            RendezvousEvent::Removed(id) => {
                let actors = self.inner.actors.read();
                if let Some(actor) = actors.get(&id) {
                    let _ = actor.tx.try_send(ActorCmd::Removed);
                }
            }
        }
    }

    /// Bind an external RPC session to an instance.
    pub fn connect_session(&self, session_id: &str, instance_id: &str) -> Result<(), HubError> {
        let id = InstanceId::new(instance_id);
        if !self.inner.actors.read().contains_key(&id) {
            return Err(HubError::UnknownInstance(instance_id.to_string()));
        }
        self.inner.sessions.write().insert(session_id.to_string(), id);
        debug!(session = session_id, instance = instance_id, "session connected");
        Ok(())
    }

    pub fn disconnect_session(&self, session_id: &str) {
        self.inner.sessions.write().remove(session_id);
    }

    /// Active client for a session's bound instance, if any.
    pub fn client_for_session(&self, session_id: &str) -> Option<Arc<RpcClient>> {
        let instance = { self.inner.sessions.read().get(session_id).cloned() }?;
        self.client_for_instance(instance.as_str())
    }

    /// Active client for an instance. `None` unless the connection is
    /// currently Active.
    pub fn client_for_instance(&self, instance_id: &str) -> Option<Arc<RpcClient>> {
        let actors = self.inner.actors.read();
        let actor = actors.get(instance_id)?;
        if actor.shared.info.read().state != ConnectionState::Active {
            return None;
        }
        let client = actor.shared.client.read().clone();
        client
    }

    /// Record a tool-call failure against an instance. State only flips
    /// when the health probe confirms.
    pub fn record_call_failure(&self, instance_id: &str) {
        let actors = self.inner.actors.read();
        if let Some(actor) = actors.get(instance_id) {
            actor.shared.call_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of every known connection, in discovery order.
    pub fn list_instances(&self) -> Vec<ConnectionInfo> {
        let sessions = self.inner.sessions.read().clone();
        self.inner
            .actors
            .read()
            .values()
            .map(|actor| {
                let mut info = actor.shared.info.read().clone();
                info.call_failures = actor.shared.call_failures.load(Ordering::Relaxed);
                info.sessions = sessions
                    .iter()
                    .filter(|(_, instance)| **instance == info.instance_id)
                    .map(|(session, _)| session.clone())
                    .collect();
                info.sessions.sort();
                info
            })
            .collect()
    }

    pub fn state_of(&self, instance_id: &str) -> Option<ConnectionState> {
        self.inner.actors.read().get(instance_id).map(|a| a.shared.info.read().state)
    }

    /// Stop every actor.
    pub async fn shutdown(&self) {
        let actors: Vec<ActorHandle> = {
            let mut guard = self.inner.actors.write();
            guard.drain(..).map(|(_, handle)| handle).collect()
        };
        for actor in actors {
            actor.task.abort();
        }
        self.inner.sessions.write().clear();
    }
}

fn now_ms() -> u64 {
    brum_core::clock::epoch_ms_now()
}

fn spawn_actor(record: InstanceRecord, config: HubConfig) -> ActorHandle {
    let (tx, rx) = mpsc::channel(16);
    let shared = Arc::new(ActorShared {
        info: RwLock::new(ConnectionInfo {
            instance_id: record.id.clone(),
            name: record.name.clone(),
            port: record.port,
            state: ConnectionState::Discovered,
            retry_count: 0,
            call_failures: 0,
            last_activity_ms: now_ms(),
            sessions: Vec::new(),
        }),
        client: RwLock::new(None),
        call_failures: AtomicU64::new(0),
    });
    let task = tokio::spawn(run_actor(record, config, Arc::clone(&shared), rx));
    ActorHandle { tx, shared, task }
}

/// The per-instance state machine.
async fn run_actor(
    mut record: InstanceRecord,
    config: HubConfig,
    shared: Arc<ActorShared>,
    mut rx: mpsc::Receiver<ActorCmd>,
) {
    let mut state = ConnectionState::Discovered;
    let mut retry_count: u32 = 0;
    let mut probe_failures: u32 = 0;

    loop {
        set_state(&shared, state, retry_count);
        match state {
            ConnectionState::Discovered => {
                // Discovery immediately initiates a connection.
                state = ConnectionState::Connecting;
            }
            ConnectionState::Connecting => {
                match connect(&record, &config).await {
                    Ok(client) => {
                        info!(instance = %record.id, "hub connection active");
                        *shared.client.write() = Some(client);
                        shared.call_failures.store(0, Ordering::Relaxed);
                        retry_count = 0;
                        probe_failures = 0;
                        state = ConnectionState::Active;
                    }
                    Err(e) => {
                        retry_count += 1;
                        debug!(instance = %record.id, attempt = retry_count, error = %e, "connect failed");
                        state = if retry_count > config.max_retries {
                            warn!(instance = %record.id, "giving up, connection dead");
                            ConnectionState::Dead
                        } else {
                            ConnectionState::Retrying
                        };
                    }
                }
            }
            ConnectionState::Retrying => {
                *shared.client.write() = None;
                let backoff = backoff_delay(&config, retry_count);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {
                        state = ConnectionState::Connecting;
                    }
                    cmd = rx.recv() => {
                        match apply_cmd(cmd, &mut record, &shared) {
                            CmdOutcome::Dead => state = ConnectionState::Dead,
                            CmdOutcome::Rediscover => {
                                retry_count = 0;
                                state = ConnectionState::Discovered;
                            }
                            CmdOutcome::Continue => {}
                            CmdOutcome::Stop => return,
                        }
                    }
                }
            }
            ConnectionState::Active => {
                tokio::select! {
                    _ = tokio::time::sleep(config.probe_interval) => {
                        // Routed-call failures since the last window count
                        // against the peer even when the probe itself still
                        // answers.
                        let routed = shared.call_failures.swap(0, Ordering::Relaxed);
                        let healthy = routed < u64::from(config.call_failure_threshold)
                            && probe(&shared, &config).await;
                        if healthy {
                            probe_failures = 0;
                            touch(&shared);
                        } else {
                            probe_failures += 1;
                            debug!(
                                instance = %record.id,
                                probe_failures,
                                routed_failures = routed,
                                "health check failed"
                            );
                            if probe_failures >= config.probe_failures {
                                retry_count = 1;
                                probe_failures = 0;
                                state = ConnectionState::Retrying;
                            }
                        }
                    }
                    cmd = rx.recv() => {
                        match apply_cmd(cmd, &mut record, &shared) {
                            CmdOutcome::Dead => {
                                *shared.client.write() = None;
                                state = ConnectionState::Dead;
                            }
                            CmdOutcome::Rediscover => {
                                *shared.client.write() = None;
                                retry_count = 0;
                                state = ConnectionState::Discovered;
                            }
                            CmdOutcome::Continue => touch(&shared),
                            CmdOutcome::Stop => return,
                        }
                    }
                }
            }
            ConnectionState::Dead => {
                *shared.client.write() = None;
                match rx.recv().await {
                    None => return,
                    Some(ActorCmd::Removed) => {}
                    Some(ActorCmd::RendezvousUpdate(update)) => {
                        // A fresh start time resurrects the instance.
                        if update.started_at > record.started_at {
                            record = update;
                            retry_count = 0;
                            state = ConnectionState::Discovered;
                        } else {
                            record = update;
                        }
                    }
                }
            }
        }
    }
}

enum CmdOutcome {
    Continue,
    Rediscover,
    Dead,
    Stop,
}

fn apply_cmd(
    cmd: Option<ActorCmd>,
    record: &mut InstanceRecord,
    shared: &Arc<ActorShared>,
) -> CmdOutcome {
    match cmd {
        None => CmdOutcome::Stop,
        Some(ActorCmd::Removed) => CmdOutcome::Dead,
        Some(ActorCmd::RendezvousUpdate(update)) => {
            let resurrect = update.started_at > record.started_at;
            let port_changed = update.port != record.port;
            *record = update;
            {
                let mut info = shared.info.write();
                info.name = record.name.clone();
                info.port = record.port;
            }
            if resurrect || port_changed {
                CmdOutcome::Rediscover
            } else {
                CmdOutcome::Continue
            }
        }
    }
}

async fn connect(record: &InstanceRecord, config: &HubConfig) -> Result<Arc<RpcClient>, HubError> {
    let client = Arc::new(RpcClient::new(record.port, config.probe_timeout)?);
    tokio::time::timeout(config.connect_timeout, client.initialize())
        .await
        .map_err(|_| HubError::Timeout)??;
    Ok(client)
}

async fn probe(shared: &Arc<ActorShared>, config: &HubConfig) -> bool {
    let client = { shared.client.read().clone() };
    let Some(client) = client else { return false };
    matches!(
        tokio::time::timeout(config.probe_timeout, client.probe()).await,
        Ok(Ok(()))
    )
}

fn set_state(shared: &Arc<ActorShared>, state: ConnectionState, retry_count: u32) {
    let mut info = shared.info.write();
    info.state = state;
    info.retry_count = retry_count;
    info.last_activity_ms = now_ms();
}

fn touch(shared: &Arc<ActorShared>) {
    shared.info.write().last_activity_ms = now_ms();
}

fn backoff_delay(config: &HubConfig, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    let delay = config.backoff_base.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(config.backoff_cap)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
