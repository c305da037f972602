// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dev-server URL detection in process output
//!
//! Framework-specific start-up banners are matched first so the discovery
//! event can carry a framework hint; a generic "listening on / running at /
//! ready" pattern catches everything else. Only local HTTP URLs are emitted.

use brum_core::{Event, EventBus, ProcessId, Subscription, Topic};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A URL found in a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlDetection {
    pub url: String,
    pub framework_hint: Option<String>,
}

struct FrameworkPattern {
    hint: &'static str,
    pattern: Regex,
}

/// Compiled detection patterns. Construction is infallible because the
/// expressions are fixed; a broken pattern is skipped with a warning.
pub struct UrlPatterns {
    frameworks: Vec<FrameworkPattern>,
    readiness: Regex,
    any_url: Regex,
}

fn compile(expr: &str) -> Option<Regex> {
    match Regex::new(expr) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(expr, error = %e, "invalid URL detection pattern");
            None
        }
    }
}

impl UrlPatterns {
    pub fn new() -> Self {
        let specs: &[(&str, &str)] = &[
            ("vite", r"(?i)(?:VITE|vite).*?(?:Local|Network):\s+(https?://\S+)"),
            ("vite", r"(?i)➜?\s*Local:\s+(https?://\S+)"),
            ("next", r"(?i)ready[ \-—]+started server on\s+(?:[^,]+,\s*)?(?:url:\s*)?(https?://\S+)"),
            ("webpack", r"(?i)project is running at:?\s*(https?://\S+)"),
            ("angular", r"(?i)Angular Live Development Server is listening.*?open your browser on\s+(https?://\S+)"),
        ];
        let frameworks = specs
            .iter()
            .filter_map(|(hint, expr)| {
                compile(expr).map(|pattern| FrameworkPattern { hint, pattern })
            })
            .collect();
        Self {
            frameworks,
            // A line must signal readiness before the generic URL extraction
            // applies; bare URLs in ordinary output are ignored.
            readiness: fixed(r"(?i)\b(listening|running|ready|started|serving|available|local)\b"),
            any_url: fixed(r"(https?://[^\s\x22'`<>)\]]+)"),
        }
    }

    /// Match a single log line against the pattern set.
    pub fn detect(&self, line: &str) -> Option<UrlDetection> {
        for fw in &self.frameworks {
            if let Some(caps) = fw.pattern.captures(line) {
                if let Some(url) = caps.get(1).and_then(|m| normalize_url(m.as_str())) {
                    return Some(UrlDetection {
                        url,
                        framework_hint: Some(fw.hint.to_string()),
                    });
                }
            }
        }
        if self.readiness.is_match(line) {
            if let Some(caps) = self.any_url.captures(line) {
                if let Some(url) = caps.get(1).and_then(|m| normalize_url(m.as_str())) {
                    return Some(UrlDetection { url, framework_hint: None });
                }
            }
        }
        None
    }
}

impl Default for UrlPatterns {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile a fixed module-level pattern.
#[allow(clippy::unwrap_used)]
fn fixed(expr: &str) -> Regex {
    Regex::new(expr).unwrap()
}

/// Normalize a candidate URL and filter to local HTTP servers.
///
/// Normal form per [`brum_core::urlnorm::normalize`]; anything that is not
/// `http` on localhost, 127.0.0.1, or 0.0.0.0 is rejected.
pub fn normalize_url(raw: &str) -> Option<String> {
    let normalized = brum_core::urlnorm::normalize(raw)?;
    let parsed = url::Url::parse(&normalized).ok()?;
    if parsed.scheme() != "http" {
        return None;
    }
    let host = parsed.host_str()?;
    if !matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0") {
        return None;
    }
    Some(normalized)
}

/// Subscriber that watches `log.line` events and publishes
/// `dev-url.detected` once per (process, normalized URL) pair.
pub struct UrlDetector {
    subscription: Subscription,
    bus: EventBus,
    task: tokio::task::JoinHandle<()>,
}

impl UrlDetector {
    /// Attach to the bus. Must be called inside a tokio runtime.
    pub fn spawn(bus: EventBus) -> Self {
        let (tx, rx) = mpsc::channel::<(ProcessId, String)>(256);
        let subscription = bus.subscribe(
            Topic::LogLine,
            Arc::new(move |event: &Event| {
                let Some(process_id) = event.process_id.clone() else { return };
                let Some(line) = event.str_field("line") else { return };
                // Detection happens on our own task; drop lines under
                // pressure rather than stall the bus worker.
                if tx.try_send((process_id, line.to_string())).is_err() {
                    debug!("url detector backlog full, dropping line");
                }
            }),
        );
        let task = tokio::spawn(run_detector(bus.clone(), rx));
        Self { subscription, bus, task }
    }

    /// Detach from the bus and stop the detection task.
    pub fn shutdown(self) {
        self.bus.unsubscribe(&self.subscription);
        self.task.abort();
    }
}

async fn run_detector(bus: EventBus, mut rx: mpsc::Receiver<(ProcessId, String)>) {
    let patterns = UrlPatterns::new();
    let mut emitted: HashMap<ProcessId, HashSet<String>> = HashMap::new();

    while let Some((process_id, line)) = rx.recv().await {
        let Some(detection) = patterns.detect(&line) else { continue };
        let fresh =
            emitted.entry(process_id.clone()).or_default().insert(detection.url.clone());
        if !fresh {
            continue;
        }
        debug!(process = %process_id, url = %detection.url, "dev server url detected");
        let mut event = Event::new(Topic::DevUrlDetected)
            .for_process(process_id)
            .with("url", detection.url.clone());
        if let Some(hint) = &detection.framework_hint {
            event = event.with("frameworkHint", hint.clone());
        }
        if bus.publish(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "url_detect_tests.rs"]
mod tests;
