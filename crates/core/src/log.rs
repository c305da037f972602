// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log entry types shared between the supervisor and the RPC surface

use crate::id::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Severity assigned to a captured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured log line. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic per-store ID.
    pub id: u64,
    pub process_id: ProcessId,
    pub process_name: String,
    pub timestamp_ms: u64,
    /// One logical line, truncated to the store's max length.
    pub content: String,
    /// True for stderr output or content classified as an error.
    pub is_error: bool,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

/// A dev-server URL discovered in process output, de-duplicated by
/// normalized URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub url: String,
    pub detected_in: ProcessId,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_hint: Option<String>,
}
