// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC dispatch for the hub's external surface
//!
//! Tool names of the form `<instanceID>_<tool>` are dispatched to the
//! owning peer; unprefixed names are served locally (`instances/list`,
//! `instances/connect`). Batched array requests yield an array response
//! with matching IDs.

use crate::client::HubError;
use crate::manager::HubManager;
use serde_json::{json, Value};
use tracing::{debug, warn};

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Split a namespaced tool name on the FIRST underscore. The suffix is the
/// peer-side tool name, which may itself contain underscores.
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    let (prefix, tool) = name.split_once('_')?;
    if prefix.is_empty() || tool.is_empty() {
        return None;
    }
    Some((prefix, tool))
}

/// Dispatches external JSON-RPC requests across the hub's peers.
#[derive(Clone)]
pub struct HubRouter {
    manager: HubManager,
    server_name: String,
}

impl HubRouter {
    pub fn new(manager: HubManager, server_name: impl Into<String>) -> Self {
        Self { manager, server_name: server_name.into() }
    }

    /// Handle a raw request body: a single request object or a batch array.
    /// `session_id` identifies the external caller for session routing.
    pub async fn dispatch(&self, body: Value, session_id: Option<&str>) -> Value {
        match body {
            Value::Array(requests) => {
                let mut responses = Vec::with_capacity(requests.len());
                for request in requests {
                    responses.push(self.dispatch_one(request, session_id).await);
                }
                Value::Array(responses)
            }
            other => self.dispatch_one(other, session_id).await,
        }
    }

    async fn dispatch_one(&self, request: Value, session_id: Option<&str>) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return error_response(id, INVALID_REQUEST, "missing method");
        };
        if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return error_response(id, INVALID_REQUEST, "jsonrpc must be \"2.0\"");
        }
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        debug!(method, "hub rpc dispatch");

        match method {
            "initialize" => result_response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": { "name": self.server_name, "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {} },
                }),
            ),
            "tools/list" => self.tools_list(id).await,
            "tools/call" => self.tools_call(id, params, session_id).await,
            "resources/list" => result_response(id, json!({ "resources": [] })),
            "prompts/list" => result_response(id, json!({ "prompts": [] })),
            _ => error_response(id, METHOD_NOT_FOUND, &format!("unknown method '{method}'")),
        }
    }

    /// Local tools plus every Active peer's tools under its prefix.
    async fn tools_list(&self, id: Value) -> Value {
        let mut tools = vec![
            json!({
                "name": "instances/list",
                "description": "List known Brummer instances and their connection state",
                "inputSchema": { "type": "object", "properties": {} },
            }),
            json!({
                "name": "instances/connect",
                "description": "Bind this session to an instance for routed tool calls",
                "inputSchema": {
                    "type": "object",
                    "properties": { "instanceId": { "type": "string" } },
                    "required": ["instanceId"],
                },
            }),
        ];

        for info in self.manager.list_instances() {
            let Some(client) = self.manager.client_for_instance(info.instance_id.as_str())
            else {
                continue;
            };
            match client.list_tools().await {
                Ok(peer_tools) => {
                    for tool in peer_tools {
                        tools.push(json!({
                            "name": format!("{}_{}", info.instance_id, tool.name),
                            "description": tool.description,
                            "inputSchema": tool.input_schema,
                        }));
                    }
                }
                Err(e) => {
                    self.manager.record_call_failure(info.instance_id.as_str());
                    warn!(instance = %info.instance_id, error = %e, "peer tools/list failed");
                }
            }
        }
        result_response(id, json!({ "tools": tools }))
    }

    async fn tools_call(&self, id: Value, params: Value, session_id: Option<&str>) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, INVALID_PARAMS, "tools/call requires 'name'");
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        match name {
            "instances/list" => {
                result_response(id, json!({ "instances": self.manager.list_instances() }))
            }
            "instances/connect" => {
                let Some(instance_id) = arguments.get("instanceId").and_then(Value::as_str)
                else {
                    return error_response(id, INVALID_PARAMS, "instanceId required");
                };
                let session = session_id.unwrap_or("default");
                match self.manager.connect_session(session, instance_id) {
                    Ok(()) => result_response(id, json!({ "connected": instance_id })),
                    Err(e) => error_response(id, INVALID_PARAMS, &e.to_string()),
                }
            }
            namespaced => match self.route_namespaced(namespaced, arguments, session_id).await {
                Ok(result) => result_response(id, result),
                Err(HubError::UnknownInstance(name)) => {
                    error_response(id, METHOD_NOT_FOUND, &format!("unknown tool '{name}'"))
                }
                Err(e) => error_response(id, INTERNAL_ERROR, &e.to_string()),
            },
        }
    }

    async fn route_namespaced(
        &self,
        name: &str,
        arguments: Value,
        session_id: Option<&str>,
    ) -> Result<Value, HubError> {
        if let Some((instance_id, tool)) = split_tool_name(name) {
            if let Some(client) = self.manager.client_for_instance(instance_id) {
                let result = client.call_tool(tool, arguments).await;
                if result.is_err() {
                    self.manager.record_call_failure(instance_id);
                }
                return result;
            }
            if self.manager.state_of(instance_id).is_some() {
                return Err(HubError::NotConnected(instance_id.to_string()));
            }
        }
        // Not a known prefix: fall back to the session's bound instance.
        if let Some(session) = session_id {
            if let Some(client) = self.manager.client_for_session(session) {
                return client.call_tool(name, arguments).await;
            }
        }
        Err(HubError::UnknownInstance(name.to_string()))
    }
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
