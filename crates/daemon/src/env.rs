// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use std::path::PathBuf;
use std::time::Duration;

/// Resolve state directory: BRUM_STATE_DIR > XDG_STATE_HOME/brummer > ~/.local/state/brummer
pub fn state_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("BRUM_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(xdg).join("brummer"));
    }
    dirs::home_dir().map(|home| home.join(".local/state/brummer"))
}

/// Rendezvous directory override. Defaults to `<state_dir>/instances`.
pub fn instances_dir() -> Option<PathBuf> {
    std::env::var("BRUM_INSTANCES_DIR").ok().map(PathBuf::from)
}

/// RPC port. 0 (the default) binds an ephemeral port.
pub fn rpc_port() -> u16 {
    std::env::var("BRUM_RPC_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Proxy mode: "reverse" (default) or "full".
pub fn proxy_mode() -> brum_proxy::ProxyMode {
    match std::env::var("BRUM_PROXY_MODE").as_deref() {
        Ok("full") => brum_proxy::ProxyMode::Full,
        _ => brum_proxy::ProxyMode::Reverse,
    }
}

/// Proxy port range, `start-end` inclusive.
pub fn proxy_port_range() -> (u16, u16) {
    let parsed = std::env::var("BRUM_PROXY_PORT_RANGE").ok().and_then(|raw| {
        let (start, end) = raw.split_once('-')?;
        Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
    });
    parsed.unwrap_or((20_888, 21_887))
}

/// Hub mode: aggregate peer instances behind this daemon's RPC surface.
pub fn hub_mode() -> bool {
    matches!(std::env::var("BRUM_HUB").as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

/// Instance display name. Defaults to the working directory's file name.
pub fn instance_name(work_dir: &std::path::Path) -> String {
    if let Ok(name) = std::env::var("BRUM_NAME") {
        if !name.is_empty() {
            return name;
        }
    }
    work_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "brummer".to_string())
}

/// Delay between graceful termination and forced kill of child processes.
pub fn graceful_timeout() -> Duration {
    std::env::var("BRUM_GRACEFUL_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5))
}

/// Shutdown drain deadline per component level.
pub fn drain_timeout() -> Duration {
    std::env::var("BRUM_DRAIN_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
