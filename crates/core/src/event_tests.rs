// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn topic_string_roundtrip() {
    let topics = vec![
        Topic::ProcessStarted,
        Topic::ProcessExited,
        Topic::LogLine,
        Topic::ErrorDetected,
        Topic::DevUrlDetected,
        Topic::ProxyStarted,
        Topic::ProxyRequest,
        Topic::TelemetryReceived,
        Topic::McpActivity,
        Topic::InternalError,
    ];
    for topic in topics {
        let s = topic.as_str().to_string();
        assert_eq!(Topic::from(s), topic);
    }
}

#[test]
fn unknown_topic_becomes_custom() {
    let topic = Topic::from("something.else".to_string());
    assert_eq!(topic, Topic::Custom("something.else".to_string()));
    assert_eq!(topic.as_str(), "something.else");
}

#[yare::parameterized(
    log_line = { Topic::LogLine, TopicPriority::Low },
    mcp_activity = { Topic::McpActivity, TopicPriority::Low },
    proxy_request = { Topic::ProxyRequest, TopicPriority::Low },
    process_started = { Topic::ProcessStarted, TopicPriority::High },
    process_exited = { Topic::ProcessExited, TopicPriority::High },
    error_detected = { Topic::ErrorDetected, TopicPriority::High },
)]
fn topic_priorities(topic: Topic, expected: TopicPriority) {
    assert_eq!(topic.priority(), expected);
}

#[test]
fn event_builder_sets_fields() {
    let event = Event::at(Topic::LogLine, 42)
        .for_process("web-1")
        .with("line", "ready")
        .with("isError", false);

    assert_eq!(event.timestamp_ms, 42);
    assert_eq!(event.process_id.as_ref().map(|p| p.as_str()), Some("web-1"));
    assert_eq!(event.str_field("line"), Some("ready"));
    assert_eq!(event.bool_field("isError"), Some(false));
}

#[test]
fn event_serialization_roundtrip() {
    let event = Event::at(Topic::DevUrlDetected, 1_000)
        .for_process("web-1")
        .with("url", "http://localhost:3000");
    let json = serde_json::to_string(&event).unwrap();
    let parsed: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(event, parsed);
    assert!(json.contains(r#""topic":"dev-url.detected""#));
}
