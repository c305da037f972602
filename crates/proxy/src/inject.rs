// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTML response rewriting
//!
//! Inserts the monitoring agent into HTML responses on their way back to
//! the browser. Injection is idempotent (sentinel comment) and skipped for
//! background requests so AJAX payloads and sub-resources pass untouched.

use crate::agent::AGENT_SOURCE;
use crate::INJECTION_MARKER;
use http::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Classify a request as background (AJAX / fetch / sub-resource) from its
/// headers. Background responses are never rewritten.
pub fn is_background_request(headers: &HeaderMap) -> bool {
    if headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
    {
        return true;
    }
    if let Some(mode) = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
        if !mode.eq_ignore_ascii_case("navigate") {
            return true;
        }
    }
    if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
        if !dest.eq_ignore_ascii_case("document") {
            return true;
        }
    }
    if let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
        let accepts_html = accept.contains("text/html")
            || accept.contains("application/xhtml")
            || accept.contains("*/*");
        if !accepts_html {
            return true;
        }
    }
    false
}

/// Whether a response declares an HTML body.
pub fn is_html_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"))
}

/// Build the injected block: sentinel, preamble wiring, agent source.
fn injection_block(process_name: &str, proxy_host: &str) -> String {
    let process = serde_json::to_string(process_name).unwrap_or_else(|_| "\"\"".to_string());
    let host = serde_json::to_string(proxy_host).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "\n{INJECTION_MARKER}\n<script>window.__BRUMMER__ = {{ processName: {process}, proxyHost: {host} }};</script>\n<script>{AGENT_SOURCE}</script>\n"
    )
}

/// Insert the monitoring block into an HTML document.
///
/// Placement: immediately before the last `</body>`, falling back to the
/// last `</html>`, falling back to appending. Returns the body unchanged
/// when the sentinel is already present.
pub fn inject_into_html(body: &str, process_name: &str, proxy_host: &str) -> (String, bool) {
    if body.contains(INJECTION_MARKER) {
        return (body.to_string(), false);
    }
    let block = injection_block(process_name, proxy_host);
    let lower = body.to_ascii_lowercase();
    let insert_at = lower.rfind("</body>").or_else(|| lower.rfind("</html>"));
    let mut out = String::with_capacity(body.len() + block.len());
    match insert_at {
        Some(pos) => {
            out.push_str(&body[..pos]);
            out.push_str(&block);
            out.push_str(&body[pos..]);
        }
        None => {
            out.push_str(body);
            out.push_str(&block);
        }
    }
    (out, true)
}

/// Rewrite a buffered response body, transparently handling gzip.
///
/// Returns the possibly-rewritten bytes and whether anything changed.
/// Unsupported encodings and decode failures pass the body through
/// untouched.
pub async fn rewrite_body(
    response_headers: &HeaderMap,
    body: &[u8],
    process_name: &str,
    proxy_host: &str,
) -> (Vec<u8>, bool) {
    let encoding = response_headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match encoding.as_str() {
        "" | "identity" => {
            let text = String::from_utf8_lossy(body);
            let (rewritten, changed) = inject_into_html(&text, process_name, proxy_host);
            if changed {
                (rewritten.into_bytes(), true)
            } else {
                (body.to_vec(), false)
            }
        }
        "gzip" => {
            let decompressed = match gunzip(body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "gzip decode failed, passing body through");
                    return (body.to_vec(), false);
                }
            };
            let text = String::from_utf8_lossy(&decompressed);
            let (rewritten, changed) = inject_into_html(&text, process_name, proxy_host);
            if !changed {
                return (body.to_vec(), false);
            }
            match gzip(rewritten.as_bytes()).await {
                Ok(bytes) => (bytes, true),
                Err(e) => {
                    debug!(error = %e, "gzip encode failed, passing body through");
                    (body.to_vec(), false)
                }
            }
        }
        other => {
            debug!(encoding = other, "unsupported encoding, skipping injection");
            (body.to_vec(), false)
        }
    }
}

async fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

async fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = async_compression::tokio::bufread::GzipEncoder::new(data);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await?;
    Ok(out)
}

#[cfg(test)]
#[path = "inject_tests.rs"]
mod tests;
