// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proxy auto-configuration file generation

/// Build the PAC script pointing browsers at the forward-mode control port.
/// HTTPS is listed with a DIRECT fallback: the proxy refuses CONNECT, so
/// clients tunnel TLS themselves.
pub fn pac_file(control_port: u16) -> String {
    format!(
        r#"function FindProxyForURL(url, host) {{
  if (url.substring(0, 5) === "http:" || url.substring(0, 6) === "https:") {{
    return "PROXY localhost:{control_port}; DIRECT";
  }}
  return "DIRECT";
}}
"#
    )
}

/// MIME type for PAC responses.
pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

#[cfg(test)]
#[path = "pac_tests.rs"]
mod tests;
