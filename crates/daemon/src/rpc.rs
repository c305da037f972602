// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External RPC listener
//!
//! JSON-RPC 2.0 over HTTP POST. A plain instance serves its own tools;
//! in hub mode the listener hands dispatch to the hub router, which
//! namespaces every peer's tools behind this single surface.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use brum_core::{Event, EventBus, Topic};
use brum_hub::HubRouter;
use brum_proxy::ProxyFleet;
use brum_supervisor::{LogStore, Supervisor};
use brum_telemetry::TelemetryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Session header for external callers; hub routing binds sessions to
/// instances by this value.
const SESSION_HEADER: &str = "mcp-session-id";

/// The daemon's own tool surface.
#[derive(Clone)]
pub struct InstanceRpc {
    bus: EventBus,
    supervisor: Supervisor,
    logs: LogStore,
    fleet: ProxyFleet,
    telemetry: TelemetryStore,
    server_name: String,
}

impl InstanceRpc {
    pub fn new(
        bus: EventBus,
        supervisor: Supervisor,
        logs: LogStore,
        fleet: ProxyFleet,
        telemetry: TelemetryStore,
        server_name: impl Into<String>,
    ) -> Self {
        Self { bus, supervisor, logs, fleet, telemetry, server_name: server_name.into() }
    }

    /// Handle a raw body: single request or batch array.
    pub async fn dispatch(&self, body: Value) -> Value {
        match body {
            Value::Array(requests) => {
                let mut responses = Vec::with_capacity(requests.len());
                for request in requests {
                    responses.push(self.dispatch_one(request).await);
                }
                Value::Array(responses)
            }
            other => self.dispatch_one(other).await,
        }
    }

    async fn dispatch_one(&self, request: Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return error_response(id, INVALID_REQUEST, "missing method");
        };
        if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return error_response(id, INVALID_REQUEST, "jsonrpc must be \"2.0\"");
        }
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        debug!(method, "instance rpc dispatch");

        match method {
            "initialize" => result_response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": { "name": self.server_name, "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {} },
                }),
            ),
            "tools/list" => result_response(id, json!({ "tools": tool_catalog() })),
            "tools/call" => self.tools_call(id, params).await,
            "resources/list" => result_response(id, json!({ "resources": [] })),
            "prompts/list" => result_response(id, json!({ "prompts": [] })),
            _ => error_response(id, METHOD_NOT_FOUND, &format!("unknown method '{method}'")),
        }
    }

    async fn tools_call(&self, id: Value, params: Value) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, INVALID_PARAMS, "tools/call requires 'name'");
        };
        let args = params.get("arguments").cloned().unwrap_or(json!({}));
        let _ = self.bus.publish(Event::new(Topic::McpActivity).with("tool", name)).await;

        let result = match name {
            "scripts/run" => {
                let Some(script) = args.get("name").and_then(Value::as_str) else {
                    return error_response(id, INVALID_PARAMS, "script 'name' required");
                };
                match self.supervisor.start_script(script).await {
                    Ok(process) => Ok(json!({ "process": process })),
                    Err(e) => Err(e.to_string()),
                }
            }
            "scripts/stop" => {
                let Some(process_id) = args.get("processId").and_then(Value::as_str) else {
                    return error_response(id, INVALID_PARAMS, "'processId' required");
                };
                match self.supervisor.stop_process(process_id).await {
                    Ok(process) => Ok(json!({ "process": process })),
                    Err(e) => Err(e.to_string()),
                }
            }
            "scripts/status" => Ok(json!({ "processes": self.supervisor.processes() })),
            "logs/search" => {
                let query = args.get("query").and_then(Value::as_str).unwrap_or("");
                match self.logs.search(query).await {
                    Ok(entries) => Ok(json!({ "entries": entries })),
                    Err(e) => Err(e.to_string()),
                }
            }
            "logs/errors" => match self.logs.errors().await {
                Ok(entries) => Ok(json!({ "entries": entries })),
                Err(e) => Err(e.to_string()),
            },
            "urls/list" => match self.logs.urls().await {
                Ok(urls) => Ok(json!({
                    "urls": urls,
                    "mappings": self.fleet.mappings(),
                })),
                Err(e) => Err(e.to_string()),
            },
            "proxy/requests" => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
                Ok(json!({ "requests": self.fleet.recent_requests(limit) }))
            }
            "metrics/snapshot" => Ok(json!({
                "bus": self.bus.metrics(),
                "proxy": self.fleet.metrics(),
            })),
            "telemetry/sessions" => {
                let sessions = match args.get("processName").and_then(Value::as_str) {
                    Some(process) => self.telemetry.sessions_for_process(process),
                    None => self.telemetry.all_sessions(),
                };
                Ok(json!({ "sessions": sessions }))
            }
            other => {
                return error_response(id, METHOD_NOT_FOUND, &format!("unknown tool '{other}'"))
            }
        };

        match result {
            Ok(value) => result_response(id, value),
            Err(message) => error_response(id, INTERNAL_ERROR, &message),
        }
    }
}

fn tool_catalog() -> Vec<Value> {
    let object = |props: Value, required: Value| {
        json!({ "type": "object", "properties": props, "required": required })
    };
    vec![
        json!({
            "name": "scripts/run",
            "description": "Launch a script declared in the project manifest",
            "inputSchema": object(json!({ "name": { "type": "string" } }), json!(["name"])),
        }),
        json!({
            "name": "scripts/stop",
            "description": "Stop a supervised process",
            "inputSchema": object(json!({ "processId": { "type": "string" } }), json!(["processId"])),
        }),
        json!({
            "name": "scripts/status",
            "description": "List supervised processes",
            "inputSchema": object(json!({}), json!([])),
        }),
        json!({
            "name": "logs/search",
            "description": "Search captured log lines",
            "inputSchema": object(json!({ "query": { "type": "string" } }), json!([])),
        }),
        json!({
            "name": "logs/errors",
            "description": "Recent error log entries",
            "inputSchema": object(json!({}), json!([])),
        }),
        json!({
            "name": "urls/list",
            "description": "Detected dev-server URLs and their proxy mappings",
            "inputSchema": object(json!({}), json!([])),
        }),
        json!({
            "name": "proxy/requests",
            "description": "Recently captured proxy requests",
            "inputSchema": object(json!({ "limit": { "type": "integer" } }), json!([])),
        }),
        json!({
            "name": "metrics/snapshot",
            "description": "Event bus and proxy counters",
            "inputSchema": object(json!({}), json!([])),
        }),
        json!({
            "name": "telemetry/sessions",
            "description": "Browser telemetry sessions",
            "inputSchema": object(json!({ "processName": { "type": "string" } }), json!([])),
        }),
    ]
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// What the listener serves: this instance's tools, or the hub surface.
#[derive(Clone)]
pub enum RpcSurface {
    Instance(InstanceRpc),
    Hub(HubRouter),
}

/// Bind the RPC listener. Port 0 selects an ephemeral port; the bound port
/// is returned.
pub async fn serve(
    surface: RpcSurface,
    port: u16,
) -> std::io::Result<(u16, CancellationToken, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let bound = listener.local_addr()?.port();
    let router = Router::new().route("/", post(handle)).with_state(Arc::new(surface));
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone().cancelled_owned();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "rpc listener failed");
        }
    });
    Ok((bound, cancel, task))
}

async fn handle(
    State(surface): State<Arc<RpcSurface>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let session = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let response = match surface.as_ref() {
        RpcSurface::Instance(rpc) => rpc.dispatch(body).await,
        RpcSurface::Hub(router) => router.dispatch(body, session).await,
    };
    Json(response)
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
