// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The proxy fleet
//!
//! Reverse mode (default): `register_url` allocates a port and binds one
//! dedicated HTTP server per target URL. Forward mode adds a single control
//! port that browsers reach through the generated PAC file. Both share the
//! capture pipeline and the in-band telemetry endpoints.

use crate::capture::{CaptureStore, CapturedRequest};
use crate::inject::{is_background_request, is_html_response, rewrite_body};
use crate::jwt::inspect_authorization;
use crate::pac::{pac_file, PAC_CONTENT_TYPE};
use crate::ports::PortAllocator;
use crate::ws::{WsFrame, WsHub};
use crate::{TELEMETRY_PATH, WEBSOCKET_PATH};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use brum_core::{urlnorm, Clock, Event, EventBus, SystemClock, Topic};
use brum_telemetry::{PageSession, TelemetryBatch, TelemetryError, TelemetryStore, UNKNOWN_PROCESS};
use futures_util::{FutureExt, SinkExt, StreamExt};
use http::header::{
    HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
    CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const X_CONTENT_SECURITY_POLICY: &str = "x-content-security-policy";

/// Operating mode, selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// One dedicated server per registered target URL.
    #[default]
    Reverse,
    /// Single control port; clients route through it via the PAC file.
    Full,
}

/// Fleet tuning. Defaults match production behavior.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    /// Inclusive port range for per-mapping servers (and the control port).
    pub port_range: (u16, u16),
    pub max_captured: usize,
    pub max_ws_clients: usize,
    /// Cap on buffered request/response bodies.
    pub max_body_bytes: usize,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Reverse,
            port_range: (20_888, 21_887),
            max_captured: 1_000,
            max_ws_clients: 50,
            max_body_bytes: 16 * 1024 * 1024,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors from fleet operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid target url '{0}'")]
    InvalidUrl(String),

    #[error(transparent)]
    Ports(#[from] crate::ports::PortError),

    #[error("failed to bind proxy port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Public view of one target→proxy binding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UrlMapping {
    pub target_url: String,
    pub proxy_port: u16,
    pub proxy_url: String,
    pub process_name: String,
    pub created_at_ms: u64,
}

struct MappingState {
    info: UrlMapping,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
struct FleetMetrics {
    injected: AtomicU64,
    injection_skipped: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Point-in-time fleet counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProxyMetricsSnapshot {
    pub captured: u64,
    pub injected: u64,
    pub injection_skipped: u64,
    pub upstream_errors: u64,
    pub ws_clients: u64,
    pub mappings: u64,
}

struct FleetInner {
    bus: EventBus,
    telemetry: TelemetryStore,
    client: reqwest::Client,
    ports: PortAllocator,
    mappings: RwLock<HashMap<String, Arc<MappingState>>>,
    captures: CaptureStore,
    ws: WsHub,
    config: ProxyConfig,
    clock: SystemClock,
    control: Mutex<Option<ControlServer>>,
    metrics: FleetMetrics,
}

struct ControlServer {
    port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Per-server routing context.
struct ServeCtx {
    inner: Arc<FleetInner>,
    kind: ServeKind,
    port: u16,
}

enum ServeKind {
    /// Reverse mapping: everything not in-band forwards to this target.
    Reverse { target_url: String, process_name: String },
    /// Forward-mode control port: absolute-form requests are proxied,
    /// origin-form `/` serves the status page.
    Control,
}

/// The reverse-proxy fleet. Cheap to clone.
#[derive(Clone)]
pub struct ProxyFleet {
    inner: Arc<FleetInner>,
}

impl ProxyFleet {
    pub fn new(
        bus: EventBus,
        telemetry: TelemetryStore,
        config: ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.upstream_timeout)
            .build()?;
        let (start, end) = config.port_range;
        Ok(Self {
            inner: Arc::new(FleetInner {
                bus,
                telemetry,
                client,
                ports: PortAllocator::new(start, end),
                mappings: RwLock::new(HashMap::new()),
                captures: CaptureStore::new(config.max_captured),
                ws: WsHub::new(config.max_ws_clients),
                config,
                clock: SystemClock,
                control: Mutex::new(None),
                metrics: FleetMetrics::default(),
            }),
        })
    }

    /// Start the forward-mode control server. No-op in reverse mode.
    pub async fn start(&self) -> Result<Option<u16>, ProxyError> {
        if self.inner.config.mode != ProxyMode::Full {
            return Ok(None);
        }
        let (port, listener) = self.bind_in_range().await?;
        let ctx = Arc::new(ServeCtx {
            inner: Arc::clone(&self.inner),
            kind: ServeKind::Control,
            port,
        });
        let cancel = CancellationToken::new();
        let task = spawn_server(listener, ctx, cancel.clone());
        *self.inner.control.lock() = Some(ControlServer { port, cancel, task });
        info!(port, "forward proxy control server started");
        Ok(Some(port))
    }

    /// Port of the forward-mode control server, if running.
    pub fn control_port(&self) -> Option<u16> {
        self.inner.control.lock().as_ref().map(|c| c.port)
    }

    /// Bind a dedicated reverse proxy for a target URL. Registering the
    /// same normalized target twice returns the existing mapping.
    pub async fn register_url(
        &self,
        target_url: &str,
        process_name: &str,
    ) -> Result<UrlMapping, ProxyError> {
        let normalized = urlnorm::normalize(target_url)
            .ok_or_else(|| ProxyError::InvalidUrl(target_url.to_string()))?;
        if let Some(existing) = self.inner.mappings.read().get(&normalized) {
            return Ok(existing.info.clone());
        }

        let (port, listener) = self.bind_in_range().await?;
        let info = UrlMapping {
            target_url: normalized.clone(),
            proxy_port: port,
            proxy_url: format!("http://localhost:{port}"),
            process_name: process_name.to_string(),
            created_at_ms: self.inner.clock.epoch_ms(),
        };
        let ctx = Arc::new(ServeCtx {
            inner: Arc::clone(&self.inner),
            kind: ServeKind::Reverse {
                target_url: normalized.clone(),
                process_name: process_name.to_string(),
            },
            port,
        });
        let cancel = CancellationToken::new();
        let task = spawn_server(listener, ctx, cancel.clone());

        let state = Arc::new(MappingState {
            info: info.clone(),
            cancel,
            task: Mutex::new(Some(task)),
        });
        {
            let mut mappings = self.inner.mappings.write();
            // A racing registration may have won; keep the first one.
            if let Some(existing) = mappings.get(&normalized) {
                let existing = existing.info.clone();
                drop(mappings);
                state.cancel.cancel();
                self.inner.ports.release(port);
                return Ok(existing);
            }
            mappings.insert(normalized.clone(), state);
        }

        info!(target = %normalized, port, process = process_name, "reverse proxy started");
        let _ = self
            .inner
            .bus
            .publish(
                Event::new(Topic::ProxyStarted)
                    .with("targetUrl", normalized)
                    .with("proxyUrl", info.proxy_url.clone())
                    .with("port", port)
                    .with("processName", process_name),
            )
            .await;
        Ok(info)
    }

    /// Tear down the proxy for a target. Returns false for unknown targets.
    pub async fn unregister_url(&self, target_url: &str) -> bool {
        let Some(normalized) = urlnorm::normalize(target_url) else { return false };
        let Some(state) = self.inner.mappings.write().remove(&normalized) else {
            return false;
        };
        state.cancel.cancel();
        let task = state.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(target = %normalized, "proxy server did not stop before deadline");
            }
        }
        self.inner.ports.release(state.info.proxy_port);
        info!(target = %normalized, "reverse proxy stopped");
        true
    }

    /// Registered mappings, newest first.
    pub fn mappings(&self) -> Vec<UrlMapping> {
        let mut all: Vec<UrlMapping> =
            self.inner.mappings.read().values().map(|m| m.info.clone()).collect();
        all.sort_by(|a, b| {
            b.created_at_ms.cmp(&a.created_at_ms).then_with(|| b.proxy_port.cmp(&a.proxy_port))
        });
        all
    }

    /// Most recent captured requests, newest first.
    pub fn recent_requests(&self, limit: usize) -> Vec<CapturedRequest> {
        self.inner.captures.recent(limit)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.inner.captures.all()
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.inner.telemetry
    }

    /// Ingest a telemetry batch (HTTP and WebSocket share this path):
    /// resolve the owning process, store, back-link captured requests, then
    /// fan out to connected WebSocket clients.
    pub fn ingest_batch(&self, batch: TelemetryBatch) -> Result<PageSession, TelemetryError> {
        self.inner.ingest_batch(batch)
    }

    pub fn metrics(&self) -> ProxyMetricsSnapshot {
        ProxyMetricsSnapshot {
            captured: self.inner.captures.len() as u64,
            injected: self.inner.metrics.injected.load(Ordering::Relaxed),
            injection_skipped: self.inner.metrics.injection_skipped.load(Ordering::Relaxed),
            upstream_errors: self.inner.metrics.upstream_errors.load(Ordering::Relaxed),
            ws_clients: self.inner.ws.client_count() as u64,
            mappings: self.inner.mappings.read().len() as u64,
        }
    }

    /// Stop every server and release every port.
    pub async fn shutdown(&self) {
        if let Some(control) = self.inner.control.lock().take() {
            control.cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), control.task).await;
            self.inner.ports.release(control.port);
        }
        let targets: Vec<String> =
            self.inner.mappings.read().keys().cloned().collect();
        for target in targets {
            self.unregister_url(&target).await;
        }
    }

    async fn bind_in_range(&self) -> Result<(u16, tokio::net::TcpListener), ProxyError> {
        // The allocator's test bind and our real bind race with other
        // processes; retry a few ports before giving up.
        let mut last_err: Option<(u16, std::io::Error)> = None;
        for _ in 0..8 {
            let port = self.inner.ports.allocate()?;
            match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(source) => {
                    self.inner.ports.release(port);
                    last_err = Some((port, source));
                }
            }
        }
        match last_err {
            Some((port, source)) => Err(ProxyError::Bind { port, source }),
            None => Err(ProxyError::Ports(crate::ports::PortError::Exhausted(
                self.inner.config.port_range.0,
                self.inner.config.port_range.1,
            ))),
        }
    }
}

/// Weak handle satisfying the telemetry store's resolver abstraction. Weak
/// because the fleet itself holds the telemetry store.
struct FleetResolver {
    inner: std::sync::Weak<FleetInner>,
}

impl brum_telemetry::ProcessResolver for FleetResolver {
    fn lookup_process_for_url(&self, url: &str) -> Option<String> {
        self.inner.upgrade()?.lookup_process_for_url(url)
    }
}

impl ProxyFleet {
    /// Resolver over this fleet's URL table, for the telemetry store.
    pub fn resolver(&self) -> Arc<dyn brum_telemetry::ProcessResolver> {
        Arc::new(FleetResolver { inner: Arc::downgrade(&self.inner) })
    }
}

impl FleetInner {
    /// Resolve the owning process for a URL: by target prefix first, then
    /// by matching the host against a registered proxy host.
    fn lookup_process_for_url(&self, url: &str) -> Option<String> {
        let normalized = urlnorm::normalize(url)?;
        let host = urlnorm::host_port(&normalized);
        let mappings = self.mappings.read();
        for mapping in mappings.values() {
            if normalized.starts_with(&mapping.info.target_url) {
                return Some(mapping.info.process_name.clone());
            }
        }
        if let Some(host) = host {
            for mapping in mappings.values() {
                let proxy_host = format!("localhost:{}", mapping.info.proxy_port);
                let loop_host = format!("127.0.0.1:{}", mapping.info.proxy_port);
                if host == proxy_host || host == loop_host {
                    return Some(mapping.info.process_name.clone());
                }
            }
        }
        None
    }

    fn ingest_batch(&self, batch: TelemetryBatch) -> Result<PageSession, TelemetryError> {
        let process_name = batch
            .metadata
            .url
            .as_deref()
            .and_then(|url| self.lookup_process_for_url(url))
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
        let broadcast_frame = json!({
            "type": "telemetry",
            "data": {
                "sessionId": batch.session_id,
                "processName": process_name,
                "eventCount": batch.events.len(),
            },
        })
        .to_string();

        let session = self.telemetry.add_batch(batch, &process_name)?;

        if let Some(normalized) = urlnorm::normalize(&session.url) {
            let linked = self.captures.link_session(&normalized, &session.session_id);
            if linked > 0 {
                debug!(session = %session.session_id, linked, "captured requests linked");
            }
        }

        let bus = self.bus.clone();
        let event = Event::new(Topic::TelemetryReceived)
            .with("sessionId", session.session_id.as_str())
            .with("processName", session.process_name.clone())
            .with("url", session.url.clone());
        tokio::spawn(async move {
            let _ = bus.publish(event).await;
        });

        self.ws.broadcast(&broadcast_frame);
        Ok(session)
    }
}

fn spawn_server(
    listener: tokio::net::TcpListener,
    ctx: Arc<ServeCtx>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let router = build_router(ctx);
    tokio::spawn(async move {
        let shutdown = cancel.cancelled_owned();
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "proxy server failed");
        }
    })
}

fn build_router(ctx: Arc<ServeCtx>) -> Router {
    Router::new()
        .route(TELEMETRY_PATH, post(telemetry_ingest).options(telemetry_preflight))
        .route(WEBSOCKET_PATH, get(ws_upgrade))
        .route("/proxy.pac", get(serve_pac))
        .route("/pac", get(serve_pac))
        .fallback(proxy_handler)
        .with_state(ctx)
}

/// CORS headers for the open telemetry ingest endpoint.
fn telemetry_cors(headers: &mut HeaderMap) {
    let pairs = [
        ("access-control-allow-origin", "*"),
        ("access-control-allow-methods", "POST, OPTIONS"),
        ("access-control-allow-headers", "Content-Type"),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value))
        {
            headers.insert(name, value);
        }
    }
}

async fn telemetry_preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    telemetry_cors(response.headers_mut());
    response
}

async fn telemetry_ingest(State(ctx): State<Arc<ServeCtx>>, body: axum::body::Bytes) -> Response {
    let mut response = match serde_json::from_slice::<TelemetryBatch>(&body) {
        Ok(batch) => match ctx.inner.ingest_batch(batch) {
            Ok(_) => (StatusCode::OK, axum::Json(json!({"status": "ok"}))).into_response(),
            Err(e) => {
                warn!(error = %e, "telemetry batch rejected");
                (StatusCode::BAD_REQUEST, axum::Json(json!({"error": e.to_string()})))
                    .into_response()
            }
        },
        Err(e) => {
            warn!(error = %e, "malformed telemetry batch");
            (StatusCode::BAD_REQUEST, axum::Json(json!({"error": "invalid json"})))
                .into_response()
        }
    };
    telemetry_cors(response.headers_mut());
    response
}

async fn serve_pac(State(ctx): State<Arc<ServeCtx>>) -> Response {
    let control_port = ctx.inner.control.lock().as_ref().map(|c| c.port).unwrap_or(ctx.port);
    (
        StatusCode::OK,
        [(CONTENT_TYPE, PAC_CONTENT_TYPE)],
        pac_file(control_port),
    )
        .into_response()
}

/// Entry point for everything that is not an in-band endpoint. A panic in
/// the pipeline is caught here so one request cannot take the server down.
async fn proxy_handler(State(ctx): State<Arc<ServeCtx>>, req: Request) -> Response {
    let result = std::panic::AssertUnwindSafe(handle_proxied(ctx, req)).catch_unwind().await;
    match result {
        Ok(response) => response,
        Err(_) => {
            error!("proxy request handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error").into_response()
        }
    }
}

async fn handle_proxied(ctx: Arc<ServeCtx>, req: Request) -> Response {
    match &ctx.kind {
        ServeKind::Reverse { target_url, process_name } => {
            let target = target_url.clone();
            let process = process_name.clone();
            forward(ctx, req, target, process).await
        }
        ServeKind::Control => {
            if req.method() == Method::CONNECT {
                // HTTPS is never intercepted; the PAC lists DIRECT as the
                // fallback, so refusing the tunnel sends clients there.
                return (StatusCode::BAD_GATEWAY, "CONNECT not supported").into_response();
            }
            if req.uri().authority().is_some() {
                let target = req.uri().to_string();
                let process = ctx
                    .inner
                    .lookup_process_for_url(&target)
                    .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
                return forward(ctx, req, target, process).await;
            }
            if req.method() == Method::GET && req.uri().path() == "/" {
                return status_page(&ctx);
            }
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Forward one request to its target, capture it, and rewrite HTML
/// responses on the way back.
async fn forward(
    ctx: Arc<ServeCtx>,
    req: Request,
    target_base: String,
    process_name: String,
) -> Response {
    let inner = &ctx.inner;
    let started = std::time::Instant::now();
    let started_at_ms = inner.clock.epoch_ms();

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let request_host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", ctx.port));
    // The URL the client actually asked for, before any rewrite.
    let original_url = if req.uri().authority().is_some() {
        req.uri().to_string()
    } else {
        format!("http://{request_host}{path_and_query}")
    };
    let target_url = if matches!(ctx.kind, ServeKind::Control) {
        target_base.clone()
    } else {
        format!("{}{}", target_base.trim_end_matches('/'), path_and_query)
    };

    let auth = inspect_authorization(
        req.headers().get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
    );
    let is_xhr = req
        .headers()
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"));
    let background = is_background_request(req.headers());
    let request_headers = filtered_request_headers(req.headers());

    let body = match axum::body::to_bytes(req.into_body(), inner.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };

    let upstream = inner
        .client
        .request(method.clone(), target_url.as_str())
        .headers(request_headers)
        .body(body.to_vec())
        .send()
        .await;

    let mut capture = CapturedRequest {
        id: uuid::Uuid::new_v4().to_string(),
        method: method.to_string(),
        url: original_url,
        host: request_host,
        path: path_and_query,
        status_code: 0,
        started_at_ms,
        duration_ms: 0,
        size_bytes: 0,
        error: None,
        process_name: process_name.clone(),
        session_id: None,
        has_telemetry: false,
        auth,
        is_error: false,
        is_xhr,
        content_type: None,
    };

    let response = match upstream {
        Err(e) => {
            inner.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
            capture.duration_ms = started.elapsed().as_millis() as u64;
            capture.error = Some(e.to_string());
            warn!(target = %target_url, error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, format!("upstream unreachable: {e}")).into_response()
        }
        Ok(upstream) => {
            let status = upstream.status();
            let mut response_headers = upstream.headers().clone();
            let body = match upstream.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    inner.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
                    capture.duration_ms = started.elapsed().as_millis() as u64;
                    capture.error = Some(e.to_string());
                    finish_capture(inner, capture).await;
                    return (StatusCode::BAD_GATEWAY, format!("upstream body error: {e}"))
                        .into_response();
                }
            };

            capture.status_code = status.as_u16();
            capture.is_error = status.as_u16() >= 400;
            capture.size_bytes = body.len() as u64;
            capture.content_type = response_headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            capture.duration_ms = started.elapsed().as_millis() as u64;

            let inject = is_html_response(&response_headers) && !background;
            let body = if inject {
                let proxy_host = format!("localhost:{}", ctx.port);
                let (rewritten, changed) =
                    rewrite_body(&response_headers, &body, &process_name, &proxy_host).await;
                if changed {
                    inner.metrics.injected.fetch_add(1, Ordering::Relaxed);
                    response_headers.remove(CONTENT_SECURITY_POLICY);
                    response_headers.remove(X_CONTENT_SECURITY_POLICY);
                } else {
                    inner.metrics.injection_skipped.fetch_add(1, Ordering::Relaxed);
                }
                rewritten
            } else {
                if is_html_response(&response_headers) {
                    inner.metrics.injection_skipped.fetch_add(1, Ordering::Relaxed);
                }
                body.to_vec()
            };

            client_response(status, &response_headers, body)
        }
    };

    finish_capture(inner, capture).await;
    response
}

async fn finish_capture(inner: &Arc<FleetInner>, capture: CapturedRequest) {
    let event = Event::new(Topic::ProxyRequest)
        .with("method", capture.method.clone())
        .with("url", capture.url.clone())
        .with("status", capture.status_code)
        .with("durationMs", capture.duration_ms)
        .with("processName", capture.process_name.clone());
    let event = match &capture.error {
        Some(error) => event.with("error", error.clone()),
        None => event,
    };
    inner.captures.push(capture);
    let _ = inner.bus.publish(event).await;
}

/// Headers forwarded upstream. Hop-by-hop headers are dropped and
/// `Accept-Encoding` is pinned to gzip so rewriting stays possible.
fn filtered_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let skip = name == HOST
            || name == CONTENT_LENGTH
            || name == CONNECTION
            || name == ACCEPT_ENCODING
            || name == TRANSFER_ENCODING
            || name.as_str().eq_ignore_ascii_case("proxy-connection")
            || name.as_str().eq_ignore_ascii_case("keep-alive")
            || name.as_str().eq_ignore_ascii_case("upgrade");
        if !skip {
            out.append(name.clone(), value.clone());
        }
    }
    if let Ok(value) = http::HeaderValue::from_str("gzip") {
        out.insert(ACCEPT_ENCODING, value);
    }
    out
}

/// Build the client-facing response with a correct `Content-Length`.
fn client_response(status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(body.clone()));
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in headers {
        let skip = name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION;
        if !skip {
            out.append(name.clone(), value.clone());
        }
    }
    if let Ok(value) = http::HeaderValue::from_str(&body.len().to_string()) {
        out.insert(CONTENT_LENGTH, value);
    }
    response
}

/// Human-readable status page for the forward-mode control port.
fn status_page(ctx: &Arc<ServeCtx>) -> Response {
    let mappings = {
        let mut all: Vec<UrlMapping> =
            ctx.inner.mappings.read().values().map(|m| m.info.clone()).collect();
        all.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        all
    };
    let mut rows = String::new();
    for mapping in &mappings {
        rows.push_str(&format!(
            "<tr><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td></tr>\n",
            mapping.process_name, mapping.proxy_url, mapping.proxy_url, mapping.target_url
        ));
    }
    let html = format!(
        "<html><head><title>Brummer Proxy</title></head><body>\
         <h1>Brummer Proxy</h1>\
         <p>{} mapping(s), {} captured request(s), {} telemetry client(s)</p>\
         <table border=\"1\"><tr><th>Process</th><th>Proxy</th><th>Target</th></tr>\n{rows}</table>\
         <p><a href=\"/proxy.pac\">proxy.pac</a></p>\
         </body></html>",
        mappings.len(),
        ctx.inner.captures.len(),
        ctx.inner.ws.client_count(),
    );
    (StatusCode::OK, [(CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

// --- WebSocket channel ---

async fn ws_upgrade(State(ctx): State<Arc<ServeCtx>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_client(socket, ctx))
}

async fn ws_client(socket: WebSocket, ctx: Arc<ServeCtx>) {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);
    if !ctx.inner.ws.register(&id, tx.clone()) {
        debug!(client = %id, "telemetry client rejected: hub full");
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let welcome = json!({
        "type": "connected",
        "data": {
            "serverTime": ctx.inner.clock.epoch_ms(),
            "clientCount": ctx.inner.ws.client_count(),
        },
    })
    .to_string();
    ctx.inner.ws.send_to(&id, welcome);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_ws_frame(&ctx, &id, text.as_str()),
            // tungstenite answers protocol pings itself.
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = %id, error = %e, "telemetry client read failed");
                break;
            }
        }
    }

    // Evict outside any lock; the writer drains and exits once the sender
    // in the registry is dropped.
    ctx.inner.ws.evict(&id);
    drop(tx);
    let _ = writer.await;
}

fn handle_ws_frame(ctx: &Arc<ServeCtx>, client_id: &str, raw: &str) {
    let frame: WsFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(client = client_id, error = %e, "malformed telemetry frame");
            return;
        }
    };
    let reply = match frame.kind.as_str() {
        "ping" => Some(json!({
            "type": "command_response",
            "data": { "pong": true, "serverTime": ctx.inner.clock.epoch_ms() },
        })),
        "status" => Some(json!({
            "type": "command_response",
            "data": {
                "clientCount": ctx.inner.ws.client_count(),
                "mappings": ctx.inner.mappings.read().len(),
                "captured": ctx.inner.captures.len(),
            },
        })),
        "get_requests" => {
            let limit = frame.data.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
            let requests = ctx.inner.captures.recent(limit);
            Some(json!({ "type": "requests", "data": requests }))
        }
        "get_telemetry" => {
            let sessions = ctx.inner.telemetry.all_sessions();
            let summaries: Vec<serde_json::Value> = sessions
                .iter()
                .map(|s| {
                    json!({
                        "sessionId": s.session_id,
                        "processName": s.process_name,
                        "url": s.url,
                        "events": s.events.len(),
                        "errors": s.error_count,
                    })
                })
                .collect();
            Some(json!({ "type": "telemetry_sessions", "data": summaries }))
        }
        "clear_buffer" => Some(json!({
            "type": "command_response",
            "data": { "cleared": true },
        })),
        "telemetry" => {
            match serde_json::from_value::<TelemetryBatch>(frame.data) {
                Ok(batch) => {
                    if let Err(e) = ctx.inner.ingest_batch(batch) {
                        warn!(client = client_id, error = %e, "ws telemetry rejected");
                    }
                }
                Err(e) => warn!(client = client_id, error = %e, "undecodable ws telemetry"),
            }
            None
        }
        other => Some(json!({
            "type": "error",
            "data": { "message": format!("unknown frame type '{other}'") },
        })),
    };
    if let Some(reply) = reply {
        ctx.inner.ws.send_to(client_id, reply.to_string());
    }
}

#[cfg(test)]
#[path = "fleet_tests.rs"]
mod tests;
