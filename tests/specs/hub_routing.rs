// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Two instances register in the rendezvous directory; a hub discovers
//! both and routes namespaced tool calls to the owning instance.

use super::common::{daemon_config, http_client};
use brum_daemon::lifecycle;
use brum_hub::ConnectionState;
use std::time::Duration;

#[tokio::test]
async fn hub_discovers_instances_and_routes_tool_calls() {
    // All three daemons share one state dir so they meet in
    // <state>/instances.
    let state = tempfile::tempdir().unwrap();
    let work_a = tempfile::tempdir().unwrap();
    let work_b = tempfile::tempdir().unwrap();
    let work_hub = tempfile::tempdir().unwrap();

    let instance_a = lifecycle::startup(daemon_config(
        state.path(),
        work_a.path(),
        "alpha",
        false,
        (26_300, 26_349),
    ))
    .await
    .unwrap();
    let instance_b = lifecycle::startup(daemon_config(
        state.path(),
        work_b.path(),
        "beta",
        false,
        (26_350, 26_399),
    ))
    .await
    .unwrap();
    let hub = lifecycle::startup(daemon_config(
        state.path(),
        work_hub.path(),
        "hub",
        true,
        (26_400, 26_449),
    ))
    .await
    .unwrap();

    let manager = hub.hub.clone().expect("hub mode has a manager");
    // Both peers become Active connections; the hub skips its own record.
    let mut peer_ids = Vec::new();
    for _ in 0..300 {
        peer_ids = manager
            .list_instances()
            .into_iter()
            .filter(|info| info.state == ConnectionState::Active)
            .map(|info| (info.instance_id.clone(), info.port))
            .collect();
        if peer_ids.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let a_id = peer_ids
        .iter()
        .find(|(_, port)| *port == instance_a.rpc_port)
        .map(|(id, _)| id.clone())
        .expect("instance alpha discovered and active");
    assert!(
        peer_ids.iter().any(|(_, port)| *port == instance_b.rpc_port),
        "instance beta discovered and active"
    );

    // A namespaced call through the hub reaches alpha.
    let response: serde_json::Value = http_client()
        .post(format!("http://127.0.0.1:{}/", hub.rpc_port))
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 77,
            "method": "tools/call",
            "params": { "name": format!("{a_id}_scripts/status"), "arguments": {} },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["id"], 77);
    assert_eq!(response["result"]["processes"], serde_json::json!([]));

    // Shutting beta down removes its file; its connection dies.
    let b_id = peer_ids
        .iter()
        .find(|(_, port)| *port == instance_b.rpc_port)
        .map(|(id, _)| id.clone())
        .expect("beta id");
    instance_b.shutdown().await;
    let mut dead = false;
    for _ in 0..300 {
        if manager.state_of(b_id.as_str()) == Some(ConnectionState::Dead) {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(dead, "beta's connection should be dead after its file is removed");

    hub.shutdown().await;
    instance_a.shutdown().await;
}
