// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Captured-request retention
//!
//! Every request through a proxy becomes one record. The list is bounded
//! globally (not per process): 1 000 records, oldest evicted first.

use crate::jwt::AuthInfo;
use brum_core::SessionId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// One request observed by the proxy. `url` is the original URL the client
/// asked for, before any rewrite toward the target.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub status_code: u16,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Process that owned the serving mapping at capture time.
    pub process_name: String,
    /// Telemetry session linked after the fact, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub has_telemetry: bool,
    #[serde(flatten)]
    pub auth: AuthInfo,
    pub is_error: bool,
    pub is_xhr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Bounded in-memory request log. The mutex is held only for append,
/// eviction, and snapshotting.
pub struct CaptureStore {
    requests: Mutex<VecDeque<CapturedRequest>>,
    cap: usize,
}

impl CaptureStore {
    pub fn new(cap: usize) -> Self {
        Self { requests: Mutex::new(VecDeque::new()), cap }
    }

    pub fn push(&self, request: CapturedRequest) {
        let mut requests = self.requests.lock();
        requests.push_back(request);
        while requests.len() > self.cap {
            requests.pop_front();
        }
    }

    /// Most recent requests, newest first, up to `limit`.
    pub fn recent(&self, limit: usize) -> Vec<CapturedRequest> {
        let requests = self.requests.lock();
        requests.iter().rev().take(limit).cloned().collect()
    }

    pub fn all(&self) -> Vec<CapturedRequest> {
        self.requests.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Attach a telemetry session to every unlinked request whose
    /// normalized URL matches. Returns how many records were linked.
    pub fn link_session(&self, normalized_url: &str, session_id: &SessionId) -> usize {
        let mut requests = self.requests.lock();
        let mut linked = 0;
        for request in requests.iter_mut() {
            if request.session_id.is_some() {
                continue;
            }
            let matches = brum_core::urlnorm::normalize(&request.url)
                .is_some_and(|normalized| normalized == normalized_url);
            if matches {
                request.session_id = Some(session_id.clone());
                request.has_telemetry = true;
                linked += 1;
            }
        }
        linked
    }
}

#[cfg(test)]
#[path = "capture_tests.rs"]
mod tests;
