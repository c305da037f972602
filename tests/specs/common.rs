// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the end-to-end scenarios.

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use brum_daemon::Config;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PAGE: &str = "<html><head><title>app</title></head><body><h1>app</h1></body></html>";

/// A daemon config rooted in temp directories, isolated from the host env.
pub fn daemon_config(
    state: &Path,
    work: &Path,
    name: &str,
    hub: bool,
    proxy_range: (u16, u16),
) -> Config {
    Config {
        state_dir: state.to_path_buf(),
        log_path: state.join("daemon.log"),
        instances_dir: state.join("instances"),
        work_dir: work.to_path_buf(),
        instance_name: name.to_string(),
        rpc_port: 0,
        hub_mode: hub,
        proxy_mode: brum_proxy::ProxyMode::Reverse,
        proxy_port_range: proxy_range,
        graceful_timeout: Duration::from_millis(400),
        drain_timeout: Duration::from_secs(2),
    }
}

/// Spawn a tiny dev server that serves an HTML page at `/`.
pub async fn spawn_dev_server() -> (u16, CancellationToken) {
    let router = Router::new().route(
        "/",
        get(|| async {
            ([("content-type", "text/html; charset=utf-8")], PAGE).into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone().cancelled_owned();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).with_graceful_shutdown(shutdown).await;
    });
    (port, cancel)
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Poll until `check` returns Some, or fail after ~2s.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>, what: &str) -> T {
    for _ in 0..200 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
