// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket client registry for the telemetry channel
//!
//! The registry only tracks clients and fans frames out; frame semantics
//! live with the fleet. Senders are captured outside the lock before any
//! await, so a slow client cannot hold the registry.

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// One inbound frame on the telemetry socket.
#[derive(Debug, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Bounded set of connected telemetry clients.
pub struct WsHub {
    clients: RwLock<HashMap<String, mpsc::Sender<String>>>,
    max_clients: usize,
}

impl WsHub {
    pub fn new(max_clients: usize) -> Self {
        Self { clients: RwLock::new(HashMap::new()), max_clients }
    }

    /// Register a client's outbound queue. Returns false when the hub is at
    /// capacity; the caller should close the connection.
    pub fn register(&self, id: &str, tx: mpsc::Sender<String>) -> bool {
        let mut clients = self.clients.write();
        if clients.len() >= self.max_clients {
            return false;
        }
        clients.insert(id.to_string(), tx);
        true
    }

    pub fn evict(&self, id: &str) {
        self.clients.write().remove(id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Queue a frame for one client. Best-effort.
    pub fn send_to(&self, id: &str, frame: String) {
        let tx = { self.clients.read().get(id).cloned() };
        if let Some(tx) = tx {
            if tx.try_send(frame).is_err() {
                debug!(client = id, "telemetry client queue full, frame dropped");
            }
        }
    }

    /// Queue a frame for every client. Write errors surface on the client's
    /// own read loop; eviction happens there, never here.
    pub fn broadcast(&self, frame: &str) {
        let senders: Vec<(String, mpsc::Sender<String>)> = {
            self.clients.read().iter().map(|(id, tx)| (id.clone(), tx.clone())).collect()
        };
        for (id, tx) in senders {
            if tx.try_send(frame.to_string()).is_err() {
                debug!(client = %id, "telemetry broadcast dropped for slow client");
            }
        }
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
