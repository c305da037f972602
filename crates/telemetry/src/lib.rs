// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! brum-telemetry: in-browser telemetry ingest store
//!
//! Session-keyed aggregation of event batches posted by the injected
//! monitoring agent. Everything is in memory with bounded retention; the
//! proxy links sessions back to its captured requests through the
//! [`ProcessResolver`] abstraction rather than a direct dependency.

pub mod store;
pub mod types;

pub use store::{ProcessResolver, TelemetryConfig, TelemetryError, TelemetryStore};
pub use types::{
    BatchMetadata, PageSession, StoredEvent, TelemetryBatch, TelemetryEvent, TelemetryEventType,
    Viewport,
};

/// Process name used before a session's owner is resolved.
pub const UNKNOWN_PROCESS: &str = "unknown";
