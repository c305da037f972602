// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake peer instance for hub tests: a minimal JSON-RPC server.

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct FakePeer {
    pub port: u16,
    pub calls: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl FakePeer {
    pub async fn spawn(tools: Vec<&'static str>) -> Self {
        let calls = Arc::new(AtomicU64::new(0));
        let handler_calls = Arc::clone(&calls);
        let router = Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let calls = Arc::clone(&handler_calls);
                let tools = tools.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let id = request.get("id").cloned().unwrap_or(Value::Null);
                    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
                    let result = match method {
                        "initialize" => json!({
                            "serverInfo": { "name": "fake-peer", "version": "0.0.0" },
                        }),
                        "tools/list" => json!({
                            "tools": tools
                                .iter()
                                .map(|t| json!({ "name": t, "description": "test tool" }))
                                .collect::<Vec<_>>(),
                        }),
                        "tools/call" => json!({
                            "echo": request.get("params").cloned(),
                        }),
                        _ => {
                            return Json(json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": { "code": -32601, "message": "unknown" },
                            }));
                        }
                    };
                    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).with_graceful_shutdown(shutdown).await;
        });
        Self { port, calls, cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
