// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Display-only JWT claim introspection
//!
//! Captured requests show the claims of a `Bearer` token so developers can
//! see who a request ran as. The signature is NEVER verified here; the
//! decoded claims are untrusted display data and must not feed any
//! authorization decision.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

/// What we learned about a request's `Authorization` header.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthInfo {
    pub has_auth: bool,
    /// Scheme in the header (`Bearer`, `Basic`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    /// Decoded JWT payload, unverified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_claims: Option<Map<String, Value>>,
    /// Human-readable decode failure, stored instead of claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_error: Option<String>,
}

/// Inspect an `Authorization` header value.
pub fn inspect_authorization(header: Option<&str>) -> AuthInfo {
    let Some(header) = header else { return AuthInfo::default() };
    let header = header.trim();
    if header.is_empty() {
        return AuthInfo::default();
    }

    let (scheme, rest) = match header.split_once(' ') {
        Some((scheme, rest)) => (scheme.to_string(), rest.trim()),
        None => (header.to_string(), ""),
    };
    let mut info = AuthInfo {
        has_auth: true,
        auth_type: Some(scheme.clone()),
        jwt_claims: None,
        jwt_error: None,
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return info;
    }
    match decode_claims(rest) {
        Ok(Some(claims)) => info.jwt_claims = Some(claims),
        Ok(None) => {} // Opaque bearer token, not a JWT.
        Err(e) => info.jwt_error = Some(e),
    }
    info
}

/// Decode the payload segment of a JWT-shaped token. Returns `Ok(None)` for
/// tokens that are not three dot-separated segments.
fn decode_claims(token: &str) -> Result<Option<Map<String, Value>>, String> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Ok(None);
    }
    let payload = repair_padding(segments[1]);
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(&payload))
        .map_err(|e| format!("invalid base64 payload: {e}"))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| format!("payload is not JSON: {e}"))?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err("payload is not a JSON object".to_string()),
    }
}

/// Restore stripped base64 padding so standard decoders accept the segment.
fn repair_padding(segment: &str) -> String {
    let mut out = segment.to_string();
    while out.len() % 4 != 0 {
        out.push('=');
    }
    out
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
