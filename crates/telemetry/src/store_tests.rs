// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::types::{TelemetryBatch, TelemetryEvent, TelemetryEventType};
use brum_core::FakeClock;
use serde_json::json;

fn event(kind: TelemetryEventType, data: serde_json::Value) -> TelemetryEvent {
    TelemetryEvent {
        kind,
        timestamp: Some(1),
        session_id: None,
        url: None,
        data: data.as_object().cloned().unwrap_or_default(),
    }
}

fn batch(session: &str, url: &str, events: Vec<TelemetryEvent>) -> TelemetryBatch {
    TelemetryBatch {
        session_id: session.to_string(),
        events,
        metadata: crate::types::BatchMetadata {
            url: Some(url.to_string()),
            ..Default::default()
        },
    }
}

fn store() -> (TelemetryStore<FakeClock>, FakeClock) {
    let clock = FakeClock::new();
    (TelemetryStore::with_clock(TelemetryConfig::default(), clock.clone()), clock)
}

#[test]
fn missing_session_id_is_rejected() {
    let (store, _clock) = store();
    let result = store.add_batch(batch("", "http://localhost:3000/", vec![]), "web");
    assert!(matches!(result, Err(TelemetryError::MissingSession)));
}

#[test]
fn aggregates_counters_per_session() {
    let (store, _clock) = store();
    let events = vec![
        event(TelemetryEventType::JavascriptError, json!({"message": "x"})),
        event(TelemetryEventType::UnhandledRejection, json!({})),
        event(TelemetryEventType::UserInteraction, json!({"kind": "click"})),
        event(TelemetryEventType::ConsoleOutput, json!({"level": "warn"})),
        event(TelemetryEventType::ConsoleOutput, json!({"level": "warn"})),
        event(TelemetryEventType::ConsoleOutput, json!({})),
    ];
    let session = store.add_batch(batch("s1", "http://localhost:3000/", events), "web").unwrap();
    assert_eq!(session.error_count, 2);
    assert_eq!(session.interaction_count, 1);
    assert_eq!(session.console_counts.get("warn"), Some(&2));
    assert_eq!(session.console_counts.get("log"), Some(&1));
    assert_eq!(session.events.len(), 6);
}

#[test]
fn first_performance_metrics_wins() {
    let (store, _clock) = store();
    store
        .add_batch(
            batch(
                "s1",
                "http://localhost:3000/",
                vec![event(TelemetryEventType::PerformanceMetrics, json!({"ttfb": 10}))],
            ),
            "web",
        )
        .unwrap();
    let session = store
        .add_batch(
            batch(
                "s1",
                "http://localhost:3000/",
                vec![event(TelemetryEventType::PerformanceMetrics, json!({"ttfb": 99}))],
            ),
            "web",
        )
        .unwrap();
    assert_eq!(session.performance.and_then(|p| p.get("ttfb").cloned()), Some(json!(10)));
}

#[test]
fn memory_snapshots_keep_last_twenty() {
    let (store, _clock) = store();
    for i in 0..30 {
        store
            .add_batch(
                batch(
                    "s1",
                    "http://localhost:3000/",
                    vec![event(TelemetryEventType::MemoryUsage, json!({"used": i}))],
                ),
                "web",
            )
            .unwrap();
    }
    let session = store.get_session("s1").unwrap();
    assert_eq!(session.memory_snapshots.len(), 20);
    assert_eq!(session.memory_snapshots[0].get("used"), Some(&json!(10)));
    assert_eq!(session.memory_snapshots[19].get("used"), Some(&json!(29)));
}

#[test]
fn event_list_is_capped() {
    let clock = FakeClock::new();
    let config = TelemetryConfig { max_events_per_session: 5, ..Default::default() };
    let store = TelemetryStore::with_clock(config, clock);
    for _ in 0..3 {
        store
            .add_batch(
                batch(
                    "s1",
                    "http://localhost:3000/",
                    vec![
                        event(TelemetryEventType::PageLoad, json!({})),
                        event(TelemetryEventType::DomState, json!({})),
                    ],
                ),
                "web",
            )
            .unwrap();
    }
    assert_eq!(store.get_session("s1").unwrap().events.len(), 5);
}

#[test]
fn resolver_places_unattributed_batches() {
    struct TableResolver;
    impl ProcessResolver for TableResolver {
        fn lookup_process_for_url(&self, url: &str) -> Option<String> {
            url.contains("localhost:3000").then(|| "web".to_string())
        }
    }

    let (store, _clock) = store();
    store.set_resolver(std::sync::Arc::new(TableResolver));
    let session =
        store.add_batch(batch("s1", "http://localhost:3000/", vec![]), UNKNOWN_PROCESS).unwrap();
    assert_eq!(session.process_name, "web");

    let other =
        store.add_batch(batch("s2", "http://elsewhere:9/", vec![]), UNKNOWN_PROCESS).unwrap();
    assert_eq!(other.process_name, UNKNOWN_PROCESS);
}

#[test]
fn process_name_is_never_downgraded() {
    let (store, _clock) = store();
    store.add_batch(batch("s1", "http://localhost:3000/", vec![]), "web").unwrap();
    let session =
        store.add_batch(batch("s1", "http://localhost:3000/", vec![]), UNKNOWN_PROCESS).unwrap();
    assert_eq!(session.process_name, "web");
}

#[test]
fn unknown_process_resolves_on_later_batch() {
    let (store, _clock) = store();
    store.add_batch(batch("s1", "http://localhost:3000/", vec![]), UNKNOWN_PROCESS).unwrap();
    let session = store.add_batch(batch("s1", "http://localhost:3000/", vec![]), "web").unwrap();
    assert_eq!(session.process_name, "web");
}

#[test]
fn event_url_updates_session_url() {
    let (store, _clock) = store();
    let mut ev = event(TelemetryEventType::PageLoad, json!({}));
    ev.url = Some("http://localhost:3000/settings".to_string());
    let session = store.add_batch(batch("s1", "http://localhost:3000/", vec![ev]), "web").unwrap();
    assert_eq!(session.url, "http://localhost:3000/settings");
}

#[test]
fn idle_sessions_are_reaped() {
    let (store, clock) = store();
    store.add_batch(batch("old", "http://localhost:3000/", vec![]), "web").unwrap();
    clock.advance(std::time::Duration::from_secs(31 * 60));
    store.add_batch(batch("fresh", "http://localhost:3000/", vec![]), "web").unwrap();
    assert!(store.get_session("old").is_none());
    assert!(store.get_session("fresh").is_some());
}

#[test]
fn per_process_session_count_is_capped() {
    let clock = FakeClock::new();
    let config = TelemetryConfig { max_sessions_per_process: 3, ..Default::default() };
    let store = TelemetryStore::with_clock(config, clock.clone());
    for i in 0..5 {
        clock.advance(std::time::Duration::from_secs(1));
        store
            .add_batch(batch(&format!("s{i}"), "http://localhost:3000/", vec![]), "web")
            .unwrap();
    }
    assert_eq!(store.session_count(), 3);
    // The oldest sessions by last activity were evicted.
    assert!(store.get_session("s0").is_none());
    assert!(store.get_session("s1").is_none());
    assert!(store.get_session("s4").is_some());
}

#[test]
fn long_session_ids_are_truncated() {
    let (store, _clock) = store();
    let long_id = "x".repeat(1_000);
    let session = store.add_batch(batch(&long_id, "http://localhost:3000/", vec![]), "web").unwrap();
    assert_eq!(session.session_id.as_str().len(), 128);
}

#[test]
fn snapshots_are_deep_copies() {
    let (store, _clock) = store();
    store
        .add_batch(
            batch(
                "s1",
                "http://localhost:3000/",
                vec![event(TelemetryEventType::PageLoad, json!({}))],
            ),
            "web",
        )
        .unwrap();
    let mut snapshot = store.get_session("s1").unwrap();
    snapshot.events.clear();
    snapshot.process_name = "mutated".to_string();
    let fresh = store.get_session("s1").unwrap();
    assert_eq!(fresh.events.len(), 1);
    assert_eq!(fresh.process_name, "web");
}

#[test]
fn queries_sort_by_recency() {
    let (store, clock) = store();
    store.add_batch(batch("a", "http://localhost:3000/", vec![]), "web").unwrap();
    clock.advance(std::time::Duration::from_secs(5));
    store.add_batch(batch("b", "http://localhost:3000/", vec![]), "web").unwrap();
    let sessions = store.sessions_for_process("web");
    assert_eq!(sessions[0].session_id, "b");
    assert_eq!(sessions[1].session_id, "a");
    let by_url = store.sessions_for_url("http://localhost:3000/");
    assert_eq!(by_url.len(), 2);
    assert_eq!(by_url[0].session_id, "b");
}

#[test]
fn clear_for_process_removes_only_matching() {
    let (store, _clock) = store();
    store.add_batch(batch("a", "http://localhost:3000/", vec![]), "web").unwrap();
    store.add_batch(batch("b", "http://localhost:4000/", vec![]), "api").unwrap();
    let removed = store.clear_sessions_for_process("web");
    assert_eq!(removed, 1);
    assert!(store.get_session("a").is_none());
    assert!(store.get_session("b").is_some());
}
