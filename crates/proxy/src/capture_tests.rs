// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn request(id: &str, url: &str, status: u16) -> CapturedRequest {
    CapturedRequest {
        id: id.to_string(),
        method: "GET".to_string(),
        url: url.to_string(),
        host: "localhost:20889".to_string(),
        path: "/".to_string(),
        status_code: status,
        started_at_ms: 0,
        duration_ms: 1,
        size_bytes: 10,
        error: None,
        process_name: "web".to_string(),
        session_id: None,
        has_telemetry: false,
        auth: AuthInfo::default(),
        is_error: status >= 400,
        is_xhr: false,
        content_type: Some("text/html".to_string()),
    }
}

#[test]
fn bounded_with_oldest_evicted() {
    let store = CaptureStore::new(3);
    for i in 0..5 {
        store.push(request(&format!("r{i}"), "http://localhost:20889/", 200));
    }
    let all = store.all();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, "r2");
    assert_eq!(all[2].id, "r4");
}

#[test]
fn recent_returns_newest_first() {
    let store = CaptureStore::new(10);
    for i in 0..4 {
        store.push(request(&format!("r{i}"), "http://localhost:20889/", 200));
    }
    let recent = store.recent(2);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, "r3");
    assert_eq!(recent[1].id, "r2");
}

#[test]
fn links_sessions_by_normalized_url() {
    let store = CaptureStore::new(10);
    store.push(request("a", "http://localhost:20889/", 200));
    store.push(request("b", "http://LOCALHOST:20889", 200));
    store.push(request("c", "http://localhost:20889/other", 200));

    let session = SessionId::new("s1");
    let linked = store.link_session("http://localhost:20889/", &session);
    assert_eq!(linked, 2);

    let all = store.all();
    assert!(all[0].has_telemetry);
    assert_eq!(all[0].session_id.as_ref().map(|s| s.as_str()), Some("s1"));
    assert!(all[1].has_telemetry);
    assert!(!all[2].has_telemetry);
}

#[test]
fn linked_requests_are_not_relinked() {
    let store = CaptureStore::new(10);
    store.push(request("a", "http://localhost:20889/", 200));
    store.link_session("http://localhost:20889/", &SessionId::new("s1"));
    let linked = store.link_session("http://localhost:20889/", &SessionId::new("s2"));
    assert_eq!(linked, 0);
    assert_eq!(store.all()[0].session_id.as_ref().map(|s| s.as_str()), Some("s1"));
}

#[test]
fn status_mirrors_is_error() {
    let ok = request("a", "http://localhost:20889/", 200);
    let bad = request("b", "http://localhost:20889/", 404);
    assert!(!ok.is_error);
    assert!(bad.is_error);
}
