// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: configuration, startup wiring, hierarchical shutdown
//!
//! Startup order is leaves-first (bus, log store, supervisor, detector,
//! fleet, rendezvous, hub, listener); shutdown walks the tree top-down so
//! the log store drains last and tail log lines are not lost.

use crate::env;
use crate::rpc::{self, InstanceRpc, RpcSurface};
use brum_core::{Event, EventBus, ProcessId, Topic};
use brum_hub::{
    HubConfig, HubManager, HubRouter, InstanceRecord, InstanceRegistration, RendezvousConfig,
    RendezvousWatcher,
};
use brum_proxy::{ProxyConfig, ProxyError, ProxyFleet};
use brum_supervisor::{
    LogStore, LogStoreConfig, LogStoreWorker, PackageManifest, Supervisor, SupervisorConfig,
    UrlDetector,
};
use brum_telemetry::{TelemetryConfig, TelemetryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no usable state directory")]
    NoStateDir,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Rendezvous(#[from] brum_hub::RendezvousError),
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub log_path: PathBuf,
    pub instances_dir: PathBuf,
    pub work_dir: PathBuf,
    pub instance_name: String,
    pub rpc_port: u16,
    pub hub_mode: bool,
    pub proxy_mode: brum_proxy::ProxyMode,
    pub proxy_port_range: (u16, u16),
    pub graceful_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self, LifecycleError> {
        let state_dir = env::state_dir().ok_or(LifecycleError::NoStateDir)?;
        let work_dir = std::env::current_dir()?;
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            log_path: state_dir.join("daemon.log"),
            instances_dir: env::instances_dir().unwrap_or_else(|| state_dir.join("instances")),
            instance_name: env::instance_name(&work_dir),
            rpc_port: env::rpc_port(),
            hub_mode: env::hub_mode(),
            proxy_mode: env::proxy_mode(),
            proxy_port_range: env::proxy_port_range(),
            graceful_timeout: env::graceful_timeout(),
            drain_timeout: env::drain_timeout(),
            state_dir,
            work_dir,
        })
    }
}

/// A fully wired daemon.
pub struct Daemon {
    pub config: Config,
    pub bus: EventBus,
    pub logs: LogStore,
    pub supervisor: Supervisor,
    pub fleet: ProxyFleet,
    pub telemetry: TelemetryStore,
    pub hub: Option<HubManager>,
    pub rpc_port: u16,

    log_worker: Option<LogStoreWorker>,
    detector: Option<UrlDetector>,
    registration: Option<InstanceRegistration>,
    watcher: Option<RendezvousWatcher>,
    rpc_cancel: CancellationToken,
    rpc_task: Option<tokio::task::JoinHandle<()>>,
    register_task: Option<tokio::task::JoinHandle<()>>,
    watcher_task: Option<tokio::task::JoinHandle<()>>,
}

/// Build and start every component. Must run inside a tokio runtime.
pub async fn startup(config: Config) -> Result<Daemon, LifecycleError> {
    let bus = EventBus::new();
    let (logs, log_worker) = LogStore::spawn(LogStoreConfig::default());
    let telemetry = TelemetryStore::new(TelemetryConfig::default());

    let manifest = match PackageManifest::load(&config.work_dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            info!(error = %e, "no usable manifest, script lookup disabled");
            PackageManifest::empty(&config.work_dir)
        }
    };
    let supervisor = Supervisor::new(
        bus.clone(),
        logs.clone(),
        Arc::new(manifest),
        SupervisorConfig { graceful_timeout: config.graceful_timeout },
    );

    let detector = UrlDetector::spawn(bus.clone());

    let fleet = ProxyFleet::new(
        bus.clone(),
        telemetry.clone(),
        ProxyConfig {
            mode: config.proxy_mode,
            port_range: config.proxy_port_range,
            ..Default::default()
        },
    )?;
    if let Some(port) = fleet.start().await? {
        info!(port, "forward proxy control port ready");
    }
    // Telemetry batches whose caller cannot name a process resolve through
    // the fleet's URL table.
    telemetry.set_resolver(fleet.resolver());

    // Discovered dev-server URLs spin up reverse proxies. The subscription
    // handler only forwards; registration happens on its own task.
    let register_task = spawn_url_registrar(&bus, supervisor.clone(), fleet.clone());

    let instance_id = brum_core::InstanceId::generate();

    // RPC surface: own tools, or the hub router in hub mode.
    let (hub, watcher, watcher_task, surface) = if config.hub_mode {
        let manager = HubManager::new(HubConfig::default());
        let (watcher, events) =
            RendezvousWatcher::spawn(&config.instances_dir, RendezvousConfig::default())?;
        // The hub's own record appears in the same directory; connecting to
        // ourselves would make tools/list recurse through our own surface.
        let watcher_task = spawn_rendezvous_pump(manager.clone(), events, instance_id.clone());
        let router = HubRouter::new(manager.clone(), format!("{}-hub", config.instance_name));
        (Some(manager), Some(watcher), Some(watcher_task), RpcSurface::Hub(router))
    } else {
        let rpc = InstanceRpc::new(
            bus.clone(),
            supervisor.clone(),
            logs.clone(),
            fleet.clone(),
            telemetry.clone(),
            config.instance_name.clone(),
        );
        (None, None, None, RpcSurface::Instance(rpc))
    };

    let (rpc_port, rpc_cancel, rpc_task) = rpc::serve(surface, config.rpc_port).await?;
    info!(port = rpc_port, hub = config.hub_mode, "rpc listener ready");

    // Advertise this instance to peers.
    let record =
        InstanceRecord::new(instance_id, &config.instance_name, &config.work_dir, rpc_port);
    let registration = InstanceRegistration::register(
        &config.instances_dir,
        record,
        &RendezvousConfig::default(),
    )?;

    Ok(Daemon {
        config,
        bus,
        logs,
        supervisor,
        fleet,
        telemetry,
        hub,
        rpc_port,
        log_worker: Some(log_worker),
        detector: Some(detector),
        registration: Some(registration),
        watcher,
        rpc_cancel,
        rpc_task: Some(rpc_task),
        register_task: Some(register_task),
        watcher_task,
    })
}

/// Forward `dev-url.detected` events into proxy registrations.
fn spawn_url_registrar(
    bus: &EventBus,
    supervisor: Supervisor,
    fleet: ProxyFleet,
) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<(Option<ProcessId>, String)>(64);
    bus.subscribe(
        Topic::DevUrlDetected,
        Arc::new(move |event: &Event| {
            let Some(url) = event.str_field("url") else { return };
            let _ = tx.try_send((event.process_id.clone(), url.to_string()));
        }),
    );
    tokio::spawn(async move {
        while let Some((process_id, url)) = rx.recv().await {
            let process_name = process_id
                .as_ref()
                .and_then(|id| supervisor.get_process(id.as_str()))
                .map(|p| p.name)
                .unwrap_or_else(|| brum_telemetry::UNKNOWN_PROCESS.to_string());
            match fleet.register_url(&url, &process_name).await {
                Ok(mapping) => {
                    info!(target = %url, proxy = %mapping.proxy_url, "proxy mapping ready")
                }
                Err(e) => warn!(target = %url, error = %e, "proxy registration failed"),
            }
        }
    })
}

/// Pump rendezvous events into the hub manager, skipping our own record.
fn spawn_rendezvous_pump(
    manager: HubManager,
    mut events: mpsc::Receiver<brum_hub::RendezvousEvent>,
    self_id: brum_core::InstanceId,
) -> tokio::task::JoinHandle<()> {
    use brum_hub::RendezvousEvent;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let own = match &event {
                RendezvousEvent::Added(record) | RendezvousEvent::Updated(record) => {
                    record.id == self_id
                }
                RendezvousEvent::Removed(id) => *id == self_id,
            };
            if own {
                continue;
            }
            manager.handle_rendezvous_event(event);
        }
    })
}

impl Daemon {
    /// Hierarchical shutdown: hub, proxy fleet, supervisor, telemetry,
    /// bus, log store last. Each level is bounded by the drain deadline.
    pub async fn shutdown(mut self) {
        let deadline = self.config.drain_timeout;
        info!("daemon shutting down");

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.watcher_task.take() {
            task.abort();
        }
        if let Some(hub) = self.hub.take() {
            hub.shutdown().await;
        }

        self.rpc_cancel.cancel();
        if let Some(task) = self.rpc_task.take() {
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("rpc listener did not stop before deadline");
            }
        }

        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }

        self.fleet.shutdown().await;

        // Children must be reaped before the supervisor is gone.
        self.supervisor.cleanup().await;

        if let Some(detector) = self.detector.take() {
            detector.shutdown();
        }
        if let Some(task) = self.register_task.take() {
            task.abort();
        }

        self.bus.shutdown(deadline).await;

        // The log store drains last so every tail line makes it in.
        let Daemon { logs, supervisor, fleet, telemetry, log_worker, .. } = self;
        drop(supervisor);
        drop(fleet);
        drop(telemetry);
        drop(logs);
        if let Some(worker) = log_worker {
            worker.join(deadline).await;
        }
        info!("daemon stopped");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
