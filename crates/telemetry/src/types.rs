// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire and storage types for browser telemetry

use brum_core::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};

/// Kinds of events the injected agent reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    PageLoad,
    DomState,
    VisibilityChange,
    PerformanceMetrics,
    MemoryUsage,
    ConsoleOutput,
    JavascriptError,
    UnhandledRejection,
    UserInteraction,
    ResourceTiming,
    LongTask,
    MonitorInitialized,
    /// Forward compatibility: unknown types are stored, not rejected.
    #[serde(other)]
    Unknown,
}

/// One event as posted by the agent. The client clock is untrusted; the
/// server stamps a receive time when storing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: TelemetryEventType,
    /// Client clock, epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Browser viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Batch-level context sent alongside the events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Client clock at send time, epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub connection: Option<Map<String, Value>>,
}

/// The body of `POST /__brummer_telemetry__`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    #[serde(default)]
    pub events: Vec<TelemetryEvent>,
    #[serde(default)]
    pub metadata: BatchMetadata,
}

/// An event as retained in a session, stamped with receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: TelemetryEvent,
    /// Server receive time, epoch milliseconds. Ordering within a session
    /// uses this, never the client timestamp.
    pub received_at_ms: u64,
}

/// Aggregated state for one browser page session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSession {
    pub session_id: SessionId,
    pub url: String,
    pub process_name: String,
    pub started_at_ms: u64,
    pub last_activity_ms: u64,
    pub events: Vec<StoredEvent>,
    /// First `performance_metrics` payload wins; later ones are ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<Map<String, Value>>,
    pub memory_snapshots: VecDeque<Map<String, Value>>,
    pub error_count: u64,
    pub interaction_count: u64,
    pub console_counts: HashMap<String, u64>,
}

impl PageSession {
    pub fn new(session_id: SessionId, url: String, process_name: String, now_ms: u64) -> Self {
        Self {
            session_id,
            url,
            process_name,
            started_at_ms: now_ms,
            last_activity_ms: now_ms,
            events: Vec::new(),
            performance: None,
            memory_snapshots: VecDeque::new(),
            error_count: 0,
            interaction_count: 0,
            console_counts: HashMap::new(),
        }
    }
}
