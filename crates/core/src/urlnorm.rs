// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! URL normalization shared by the detector, proxy, and telemetry linking
//!
//! Normal form: lowercase scheme and host, query and fragment discarded,
//! trailing slash stripped from the path (an empty path becomes `/`).
//! Normalization is idempotent.

/// Normalize an http(s) URL. Returns `None` when the input does not parse
/// as an absolute http(s) URL.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches([',', '.', ';']);
    let parsed = url::Url::parse(trimmed).ok()?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut path = parsed.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
    Some(format!("{scheme}://{host}{port}{path}"))
}

/// Host (and explicit port) of a URL, lowercased. `None` when unparseable.
pub fn host_port(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

#[cfg(test)]
#[path = "urlnorm_tests.rs"]
mod tests;
