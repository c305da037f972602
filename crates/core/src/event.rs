// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event model for the Brummer runtime
//!
//! Events are immutable once published. Subscribers key on [`Topic`]; the
//! payload is a free-form JSON object so every component can attach its own
//! fields without cross-crate type dependencies.

use crate::id::ProcessId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Dispatch priority of a topic when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicPriority {
    /// Drop-oldest on overflow (high-volume streams).
    Low,
    /// Block with a short timeout, then drop (lifecycle-critical).
    High,
}

/// Topics carried by the event bus.
///
/// Serializes to the wire string form (`"log.line"`, `"process.exited"`, ...).
/// Unknown strings deserialize to `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Topic {
    ProcessStarted,
    ProcessExited,
    LogLine,
    ErrorDetected,
    DevUrlDetected,
    ProxyStarted,
    ProxyRequest,
    TelemetryReceived,
    McpActivity,
    InternalError,
    /// Catch-all for unknown topic strings (extensibility)
    Custom(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::ProcessStarted => "process.started",
            Topic::ProcessExited => "process.exited",
            Topic::LogLine => "log.line",
            Topic::ErrorDetected => "error.detected",
            Topic::DevUrlDetected => "dev-url.detected",
            Topic::ProxyStarted => "proxy.started",
            Topic::ProxyRequest => "proxy.request",
            Topic::TelemetryReceived => "telemetry.received",
            Topic::McpActivity => "mcp.activity",
            Topic::InternalError => "internal.error",
            Topic::Custom(s) => s,
        }
    }

    /// Queue-overflow policy for this topic. High-volume streams drop their
    /// oldest entries; lifecycle topics briefly wait for space instead.
    pub fn priority(&self) -> TopicPriority {
        match self {
            Topic::LogLine | Topic::McpActivity | Topic::ProxyRequest => TopicPriority::Low,
            _ => TopicPriority::High,
        }
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        match s.as_str() {
            "process.started" => Topic::ProcessStarted,
            "process.exited" => Topic::ProcessExited,
            "log.line" => Topic::LogLine,
            "error.detected" => Topic::ErrorDetected,
            "dev-url.detected" => Topic::DevUrlDetected,
            "proxy.started" => Topic::ProxyStarted,
            "proxy.request" => Topic::ProxyRequest,
            "telemetry.received" => Topic::TelemetryReceived,
            "mcp.activity" => Topic::McpActivity,
            "internal.error" => Topic::InternalError,
            _ => Topic::Custom(s),
        }
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published on the bus. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<ProcessId>,
    /// Publish time, epoch milliseconds.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create an event stamped with the current wall clock.
    pub fn new(topic: Topic) -> Self {
        Self::at(topic, crate::clock::epoch_ms_now())
    }

    /// Create an event with an explicit timestamp.
    pub fn at(topic: Topic, timestamp_ms: u64) -> Self {
        Self { topic, process_id: None, timestamp_ms, payload: Map::new() }
    }

    /// Attach the originating process.
    pub fn for_process(mut self, id: impl Into<ProcessId>) -> Self {
        self.process_id = Some(id.into());
        self
    }

    /// Attach a payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Read a payload field as a string slice.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Read a payload field as a bool.
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
