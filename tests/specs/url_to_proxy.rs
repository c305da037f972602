// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A process prints its dev-server URL; a reverse proxy appears and serves
//! the instrumented page.

use super::common::{daemon_config, eventually, http_client, spawn_dev_server};
use brum_daemon::lifecycle;

#[tokio::test]
async fn printed_url_becomes_instrumented_proxy() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let daemon = lifecycle::startup(daemon_config(
        state.path(),
        work.path(),
        "e2e",
        false,
        (26_000, 26_099),
    ))
    .await
    .unwrap();

    let (dev_port, dev_cancel) = spawn_dev_server().await;
    daemon
        .supervisor
        .start_command(
            "web",
            "sh",
            &[
                "-c".to_string(),
                format!("echo 'ready - started server on http://localhost:{dev_port}'; sleep 30"),
            ],
            &[],
        )
        .await
        .unwrap();

    // Exactly one mapping appears, on a port in the configured range.
    let fleet = daemon.fleet.clone();
    let mapping = eventually(
        || fleet.mappings().into_iter().next(),
        "proxy mapping after URL detection",
    )
    .await;
    assert_eq!(daemon.fleet.mappings().len(), 1);
    assert_eq!(mapping.process_name, "web");
    assert!(mapping.proxy_port >= 26_000 && mapping.proxy_port <= 26_099);

    // The proxied page is instrumented and CSP-free.
    let response = http_client()
        .get(format!("{}/", mapping.proxy_url))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().get("content-security-policy").is_none());
    let body = response.text().await.unwrap();
    assert!(body.contains("<!-- Brummer Monitoring Script -->"));

    // Re-proxying the already-instrumented body changes nothing.
    let (rewritten, changed) =
        brum_proxy::inject::inject_into_html(&body, "web", "localhost:1");
    assert!(!changed);
    similar_asserts::assert_eq!(body, rewritten);

    daemon.shutdown().await;
    dev_cancel.cancel();
}
