// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::manager::{ConnectionState, HubConfig, HubManager};
use crate::rendezvous::{InstanceRecord, ProcessInfo, RendezvousEvent};
use crate::test_peer::FakePeer;
use brum_core::InstanceId;
use chrono::Utc;
use std::time::Duration;

#[yare::parameterized(
    simple = { "a_scripts/run", Some(("a", "scripts/run")) },
    underscore_in_tool = { "inst1_logs_search", Some(("inst1", "logs_search")) },
    no_underscore = { "instances/list", None },
    empty_prefix = { "_tool", None },
    empty_suffix = { "inst_", None },
)]
fn splits_tool_names(name: &str, expected: Option<(&str, &str)>) {
    assert_eq!(split_tool_name(name), expected);
}

fn record_for(id: &str, port: u16) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        id: InstanceId::new(id),
        name: id.to_string(),
        directory: "/tmp/project".into(),
        port,
        pid: std::process::id(),
        started_at: now,
        last_ping: now,
        process_info: ProcessInfo { pid: std::process::id() },
    }
}

fn fast_config() -> HubConfig {
    HubConfig {
        connect_timeout: Duration::from_millis(500),
        probe_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_millis(300),
        probe_failures: 2,
        call_failure_threshold: 3,
        backoff_base: Duration::from_millis(50),
        backoff_cap: Duration::from_millis(200),
        max_retries: 3,
    }
}

async fn active_hub(peers: &[(&str, u16)]) -> HubRouter {
    let manager = HubManager::new(fast_config());
    for (id, port) in peers {
        manager.handle_rendezvous_event(RendezvousEvent::Added(record_for(id, *port)));
    }
    for (id, _) in peers {
        for _ in 0..100 {
            if manager.state_of(id) == Some(ConnectionState::Active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    HubRouter::new(manager, "brummer-hub")
}

fn rpc(id: u64, method: &str, params: serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

#[tokio::test]
async fn initialize_identifies_the_hub() {
    let router = active_hub(&[]).await;
    let response = router.dispatch(rpc(1, "initialize", json!({})), None).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["serverInfo"]["name"], "brummer-hub");
}

#[tokio::test]
async fn tools_list_namespaces_peer_tools() {
    let peer = FakePeer::spawn(vec!["scripts/run"]).await;
    let router = active_hub(&[("a", peer.port)]).await;

    let response = router.dispatch(rpc(2, "tools/list", json!({})), None).await;
    let tools = response["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"instances/list"));
    assert!(names.contains(&"instances/connect"));
    assert!(names.contains(&"a_scripts/run"));
}

#[tokio::test]
async fn namespaced_call_reaches_owning_peer() {
    let peer_a = FakePeer::spawn(vec!["scripts/run"]).await;
    let peer_b = FakePeer::spawn(vec!["scripts/run"]).await;
    let router = active_hub(&[("a", peer_a.port), ("b", peer_b.port)]).await;

    let b_before = peer_b.calls.load(std::sync::atomic::Ordering::SeqCst);
    let response = router
        .dispatch(
            rpc(7, "tools/call", json!({ "name": "a_scripts/run", "arguments": { "x": 1 } })),
            None,
        )
        .await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["echo"]["name"], "scripts/run");
    assert_eq!(response["result"]["echo"]["arguments"]["x"], 1);
    // b was not consulted.
    assert_eq!(peer_b.calls.load(std::sync::atomic::Ordering::SeqCst), b_before);
}

#[tokio::test]
async fn instances_tools_are_served_locally() {
    let peer = FakePeer::spawn(vec![]).await;
    let router = active_hub(&[("a", peer.port)]).await;

    let list = router
        .dispatch(rpc(3, "tools/call", json!({ "name": "instances/list" })), None)
        .await;
    assert_eq!(list["result"]["instances"][0]["instance_id"], "a");

    let connect = router
        .dispatch(
            rpc(
                4,
                "tools/call",
                json!({ "name": "instances/connect", "arguments": { "instanceId": "a" } }),
            ),
            Some("sess-1"),
        )
        .await;
    assert_eq!(connect["result"]["connected"], "a");

    let list = router
        .dispatch(rpc(5, "tools/call", json!({ "name": "instances/list" })), None)
        .await;
    assert_eq!(list["result"]["instances"][0]["sessions"][0], "sess-1");
}

#[tokio::test]
async fn batch_requests_return_matching_ids() {
    let router = active_hub(&[]).await;
    let batch = json!([
        rpc(10, "initialize", json!({})),
        rpc(11, "resources/list", json!({})),
        rpc(12, "prompts/list", json!({})),
    ]);
    let response = router.dispatch(batch, None).await;
    let responses = response.as_array().expect("batch array");
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["id"], 10);
    assert_eq!(responses[1]["id"], 11);
    assert_eq!(responses[2]["id"], 12);
    assert_eq!(responses[1]["result"]["resources"], json!([]));
}

#[tokio::test]
async fn unknown_method_and_tool_yield_rpc_errors() {
    let router = active_hub(&[]).await;
    let response = router.dispatch(rpc(20, "nope/nothing", json!({})), None).await;
    assert_eq!(response["error"]["code"], -32601);

    let response = router
        .dispatch(rpc(21, "tools/call", json!({ "name": "ghost_tool" })), None)
        .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn missing_jsonrpc_version_is_invalid() {
    let router = active_hub(&[]).await;
    let response = router
        .dispatch(json!({ "id": 1, "method": "initialize" }), None)
        .await;
    assert_eq!(response["error"]["code"], -32600);
}
