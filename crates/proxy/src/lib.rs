// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! brum-proxy: reverse-proxy fleet with telemetry injection
//!
//! One dedicated HTTP server per registered target URL (reverse mode) or a
//! single control port driven by a PAC file (forward mode). Both modes share
//! the capture pipeline: request timing, unverified JWT introspection,
//! bounded retention, and HTML responses get the monitoring agent injected
//! before they reach the browser.

pub mod agent;
pub mod capture;
pub mod fleet;
pub mod inject;
pub mod jwt;
pub mod pac;
pub mod ports;
pub mod ws;

pub use capture::CapturedRequest;
pub use fleet::{ProxyConfig, ProxyError, ProxyFleet, ProxyMetricsSnapshot, ProxyMode, UrlMapping};
pub use jwt::AuthInfo;
pub use ports::{PortAllocator, PortError};

/// Sentinel comment marking an already-injected response body.
pub const INJECTION_MARKER: &str = "<!-- Brummer Monitoring Script -->";

/// In-band HTTP ingest endpoint served on every proxy port.
pub const TELEMETRY_PATH: &str = "/__brummer_telemetry__";

/// In-band WebSocket endpoint served on every proxy port.
pub const WEBSOCKET_PATH: &str = "/__brummer_ws__";
