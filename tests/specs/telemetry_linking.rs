// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A browser posts telemetry for a proxied page; the session is attributed
//! to the owning process and back-linked to captured requests.

use super::common::{daemon_config, http_client, spawn_dev_server};
use brum_daemon::lifecycle;

#[tokio::test]
async fn telemetry_batches_link_back_to_captures() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let daemon = lifecycle::startup(daemon_config(
        state.path(),
        work.path(),
        "e2e",
        false,
        (26_100, 26_199),
    ))
    .await
    .unwrap();

    let (dev_port, dev_cancel) = spawn_dev_server().await;
    let mapping = daemon
        .fleet
        .register_url(&format!("http://localhost:{dev_port}"), "web")
        .await
        .unwrap();

    // Browse through the proxy so captures exist.
    http_client()
        .get(format!("{}/", mapping.proxy_url))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();

    let page_url = format!("{}/", mapping.proxy_url);
    let batch = serde_json::json!({
        "sessionId": "s1",
        "events": [
            { "type": "page_load", "timestamp": 1, "sessionId": "s1",
              "url": page_url, "data": {} },
            { "type": "javascript_error", "timestamp": 2, "sessionId": "s1",
              "url": page_url, "data": { "message": "boom" } },
        ],
        "metadata": { "url": page_url },
    });
    let response = http_client()
        .post(format!("{}/__brummer_telemetry__", mapping.proxy_url))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.json::<serde_json::Value>().await.unwrap()["status"], "ok");

    let session = daemon.telemetry.get_session("s1").expect("session stored");
    assert_eq!(session.process_name, "web");
    assert_eq!(session.error_count, 1);

    let captured = daemon.fleet.requests();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].session_id.as_ref().map(|s| s.as_str()), Some("s1"));
    assert!(captured[0].has_telemetry);

    daemon.shutdown().await;
    dev_cancel.cancel();
}
