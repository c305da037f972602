// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-RPC client for peer instances

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors crossing the hub boundary.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("peer returned rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed rpc response: {0}")]
    Malformed(String),

    #[error("peer timed out")]
    Timeout,

    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("instance '{0}' is not connected")]
    NotConnected(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A tool advertised by a peer.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// HTTP JSON-RPC 2.0 client bound to one peer's RPC port.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, HubError> {
        let http = reqwest::Client::builder().no_proxy().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("http://127.0.0.1:{port}/"),
            next_id: AtomicU64::new(1),
        })
    }

    /// One JSON-RPC call; returns the `result` member.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response: Value =
            self.http.post(self.endpoint.as_str()).json(&request).send().await?.json().await?;

        if let Some(error) = response.get("error") {
            return Err(HubError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| HubError::Malformed("response has neither result nor error".into()))
    }

    pub async fn initialize(&self) -> Result<Value, HubError> {
        self.call("initialize", json!({})).await
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, HubError> {
        let result = self.call("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| HubError::Malformed("tools/list result missing 'tools'".into()))?;
        serde_json::from_value(tools).map_err(|e| HubError::Malformed(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, HubError> {
        self.call("tools/call", json!({ "name": name, "arguments": arguments })).await
    }

    /// Cheap liveness probe used by the connection health loop.
    pub async fn probe(&self) -> Result<(), HubError> {
        self.call("tools/list", json!({})).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
