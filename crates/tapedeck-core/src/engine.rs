//! Proxy engine
//!
//! An axum server that answers every non-control request either by
//! forwarding it to the real upstream (recording the exchange) or by replaying
//! the next matching exchange from the configured snapshot.
//!
//! State per configuration window is one of Idle, Recording or Replaying. The
//! window is swapped wholesale by [`Engine::configure`] and closed by
//! [`Engine::flush`].

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use bytes::Bytes;
use futures::{channel::mpsc, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::control;
use crate::error::{Error, Result, SnapshotError};
use crate::exchange::{Exchange, ExchangeRequest, ExchangeResponse, Payload, ResponseBody};
use crate::matcher::{MatchFailure, Matcher, OrderPolicy};
use crate::normalize::{NormalizationRules, Normalizer, RawRequest, HOP_BY_HOP_HEADERS};
use crate::recorder::ExchangeLog;
use crate::settings::{ModePolicy, Settings, DEFAULT_MAX_BODY_BYTES};
use crate::snapshot::{self, Snapshot, SnapshotContext};

/// Chunks buffered between the upstream reader and the client writer
const STREAM_BUFFER: usize = 16;

/// Content types relayed chunk by chunk
const STREAMING_CONTENT_TYPES: &[&str] = &[
    "text/event-stream",
    "application/x-ndjson",
    "application/jsonl",
    "application/stream+json",
];

/// Options fixed for the lifetime of an engine
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Base URL of the real API
    pub upstream_url: String,
    pub rules: NormalizationRules,
    pub mode_policy: ModePolicy,
    pub order_policy: OrderPolicy,
    pub max_body_bytes: usize,
}

impl ProxyOptions {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
            rules: NormalizationRules::default(),
            mode_policy: ModePolicy::Auto,
            order_policy: OrderPolicy::Strict,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            upstream_url: settings.upstream_url.clone(),
            rules: settings.load_rules()?,
            mode_policy: settings.mode,
            order_policy: settings.order,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    pub fn with_rules(mut self, rules: NormalizationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_mode_policy(mut self, policy: ModePolicy) -> Self {
        self.mode_policy = policy;
        self
    }

    pub fn with_order_policy(mut self, policy: OrderPolicy) -> Self {
        self.order_policy = policy;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// What the engine does with the next request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Idle,
    Recording,
    Replaying,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Idle => write!(f, "idle"),
            ProxyMode::Recording => write!(f, "recording"),
            ProxyMode::Replaying => write!(f, "replaying"),
        }
    }
}

/// Result of closing a configuration window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub mode: ProxyMode,
    pub snapshot_path: Option<PathBuf>,
    /// Whether a snapshot file was written
    pub persisted: bool,
    pub exchange_count: usize,
}

struct RecordingWindow {
    snapshot_path: PathBuf,
    context: SnapshotContext,
    normalizer: Normalizer,
}

struct ReplayWindow {
    snapshot_path: PathBuf,
    normalizer: Normalizer,
    matcher: Mutex<Matcher>,
}

#[derive(Clone)]
enum Window {
    Idle,
    Recording(Arc<RecordingWindow>),
    Replaying(Arc<ReplayWindow>),
}

impl Window {
    fn mode(&self) -> ProxyMode {
        match self {
            Window::Idle => ProxyMode::Idle,
            Window::Recording(_) => ProxyMode::Recording,
            Window::Replaying(_) => ProxyMode::Replaying,
        }
    }
}

/// The proxy engine shared by all request handlers
pub struct Engine {
    options: ProxyOptions,
    client: reqwest::Client,
    window: RwLock<Window>,
    log: ExchangeLog,
    failures: Mutex<Vec<MatchFailure>>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(options: ProxyOptions) -> Result<Self> {
        // Redirects are the client's business; relay them as-is
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {e}")))?;

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            options,
            client,
            window: RwLock::new(Window::Idle),
            log: ExchangeLog::new(),
            failures: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Router serving the control API and proxying everything else
    pub fn router(self: &Arc<Self>) -> Router {
        control::routes()
            .fallback(proxy_handler)
            .with_state(Arc::clone(self))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn mode(&self) -> ProxyMode {
        self.window.read().await.mode()
    }

    /// Defensive copy of the captured log
    pub async fn exchanges(&self) -> Vec<Exchange> {
        self.log.snapshot().await
    }

    pub async fn exchange_count(&self) -> usize {
        self.log.len().await
    }

    /// Bind the next window to a snapshot and working directory
    ///
    /// Any open window is closed first as if its test passed, and the captured
    /// log is cleared whether or not the new binding succeeds.
    pub async fn configure(
        &self,
        snapshot_path: &Path,
        work_dir: &Path,
        context: SnapshotContext,
    ) -> Result<ProxyMode> {
        let closed = self.close_window(false).await;
        self.log.reset().await;
        self.failures.lock().await.clear();
        let (previous, failures) = closed?;
        if previous.mode != ProxyMode::Idle {
            debug!("Closed previous {} window before reconfiguring", previous.mode);
        }
        for failure in failures {
            warn!(
                "Unreported replay mismatch from previous window: {}",
                failure.observed
            );
        }

        if !snapshot_path.is_absolute() {
            return Err(Error::Configuration(format!(
                "Snapshot path must be absolute: {}",
                snapshot_path.display()
            )));
        }
        if !work_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "Working directory does not exist: {}",
                work_dir.display()
            )));
        }
        let parent = snapshot_path.parent().ok_or_else(|| {
            Error::Configuration(format!(
                "Snapshot path has no parent directory: {}",
                snapshot_path.display()
            ))
        })?;

        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Configuration(format!(
                "Snapshot directory {} is unreachable: {e}",
                parent.display()
            ))
        })?;

        let normalizer = Normalizer::new(self.options.rules.clone(), work_dir);

        let recording = |normalizer: Normalizer, context: SnapshotContext| {
            Window::Recording(Arc::new(RecordingWindow {
                snapshot_path: snapshot_path.to_path_buf(),
                context,
                normalizer,
            }))
        };

        let window = match self.options.mode_policy {
            ModePolicy::Record => recording(normalizer, context),
            policy => match snapshot::load(snapshot_path) {
                Ok(loaded) if !loaded.is_empty() => {
                    let matcher = Matcher::new(
                        loaded.exchanges,
                        &self.options.rules,
                        self.options.order_policy,
                    );
                    Window::Replaying(Arc::new(ReplayWindow {
                        snapshot_path: snapshot_path.to_path_buf(),
                        normalizer,
                        matcher: Mutex::new(matcher),
                    }))
                }
                Ok(_) | Err(SnapshotError::NotFound(_)) if policy == ModePolicy::Replay => {
                    return Err(Error::Configuration(format!(
                        "No recorded snapshot at {} and replay-only mode forbids recording",
                        snapshot_path.display()
                    )));
                }
                Ok(_) | Err(SnapshotError::NotFound(_)) => recording(normalizer, context),
                Err(e) => return Err(e.into()),
            },
        };

        let mode = window.mode();
        *self.window.write().await = window;

        info!("Configured {} for {}", mode, snapshot_path.display());
        Ok(mode)
    }

    /// Close the current window: persist what was recorded unless the test
    /// failed, and report the first replay mismatch if there was one
    pub async fn flush(&self, test_failed: bool) -> Result<FlushOutcome> {
        let (outcome, failures) = self.close_window(test_failed).await?;
        match failures.into_iter().next() {
            Some(failure) => Err(failure.into()),
            None => Ok(outcome),
        }
    }

    async fn close_window(&self, test_failed: bool) -> Result<(FlushOutcome, Vec<MatchFailure>)> {
        let window = std::mem::replace(&mut *self.window.write().await, Window::Idle);
        let failures = std::mem::take(&mut *self.failures.lock().await);
        let exchanges = self.log.snapshot().await;
        let exchange_count = exchanges.len();

        let outcome = match window {
            Window::Idle => FlushOutcome {
                mode: ProxyMode::Idle,
                snapshot_path: None,
                persisted: false,
                exchange_count,
            },
            Window::Recording(recording) => {
                let mut persisted = false;
                if test_failed {
                    if exchange_count > 0 {
                        warn!(
                            "Test failed; discarding {} recorded exchange(s) for {}",
                            exchange_count,
                            recording.snapshot_path.display()
                        );
                    }
                } else if exchange_count > 0 {
                    let snapshot = Snapshot::new(recording.context.clone(), exchanges);
                    persisted = snapshot::save(&recording.snapshot_path, &snapshot)?;
                }
                FlushOutcome {
                    mode: ProxyMode::Recording,
                    snapshot_path: Some(recording.snapshot_path.clone()),
                    persisted,
                    exchange_count,
                }
            }
            Window::Replaying(replay) => {
                let remaining = replay.matcher.lock().await.remaining();
                if remaining > 0 {
                    debug!(
                        "{} recorded exchange(s) in {} were never requested",
                        remaining,
                        replay.snapshot_path.display()
                    );
                }
                FlushOutcome {
                    mode: ProxyMode::Replaying,
                    snapshot_path: Some(replay.snapshot_path.clone()),
                    persisted: false,
                    exchange_count,
                }
            }
        };

        Ok((outcome, failures))
    }

    /// Signal in-flight relays and the server to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Record mode: forward to upstream, relay and capture the response
    async fn forward(self: Arc<Self>, window: Arc<RecordingWindow>, raw: RawRequest) -> Response {
        let url = format!(
            "{}{}",
            self.options.upstream_url.trim_end_matches('/'),
            raw.path
        );

        let method = match reqwest::Method::from_bytes(raw.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                let err = Error::Configuration(format!("Invalid method {}: {e}", raw.method));
                return error_response(StatusCode::BAD_REQUEST, &err);
            }
        };

        let mut upstream_req = self.client.request(method, &url);
        for (name, value) in raw.headers.iter() {
            let name_str = name.as_str();
            if name_str == "host"
                || name_str == "content-length"
                || HOP_BY_HOP_HEADERS.contains(&name_str)
            {
                continue;
            }
            upstream_req = upstream_req.header(name.clone(), value.clone());
        }
        if !raw.body.is_empty() {
            upstream_req = upstream_req.body(raw.body.clone());
        }

        let upstream_response = match upstream_req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = Error::UpstreamForward {
                    url,
                    reason: e.to_string(),
                };
                error!("{}", err);
                return error_response(StatusCode::BAD_GATEWAY, &err);
            }
        };

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let request = window.normalizer.normalize(&raw);
        let stored_headers = self
            .options
            .rules
            .stored_headers(&headers, NormalizationRules::is_volatile_response_header);

        if is_streaming(&headers) {
            return self.relay_stream(request, status, headers, stored_headers, upstream_response);
        }

        let body = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = Error::UpstreamForward {
                    url,
                    reason: format!("failed to read response body: {e}"),
                };
                error!("{}", err);
                return error_response(StatusCode::BAD_GATEWAY, &err);
            }
        };

        let response_body = if body.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(Payload::verbatim(&body))
        };
        let index = self
            .log
            .record(
                request,
                ExchangeResponse {
                    status: status.as_u16(),
                    headers: stored_headers,
                    body: response_body,
                },
            )
            .await;
        debug!("Recorded exchange #{} {} -> {}", index, raw.path, status);

        build_response(status, &headers, Body::from(body))
    }

    /// Relay a streamed upstream body chunk by chunk on its own task,
    /// recording the exchange once the stream completes
    fn relay_stream(
        self: Arc<Self>,
        request: ExchangeRequest,
        status: StatusCode,
        headers: HeaderMap,
        stored_headers: BTreeMap<String, String>,
        upstream: reqwest::Response,
    ) -> Response {
        let (mut tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(STREAM_BUFFER);
        let mut shutdown = self.shutdown_signal();
        let engine = Arc::clone(&self);

        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let mut stream = Box::pin(upstream.bytes_stream());
            let mut chunks = Vec::new();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("Proxy stopping; abandoning stream for {}", request.path);
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(chunk)) => {
                            chunks.push(Payload::verbatim(&chunk));
                            if tx.send(Ok(chunk)).await.is_err() {
                                debug!("Client went away mid-stream for {}", request.path);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Upstream stream error for {}: {}", request.path, e);
                            let _ = tx.send(Err(std::io::Error::other(e))).await;
                            return;
                        }
                        None => break,
                    }
                }
            }
            drop(tx);

            let chunk_count = chunks.len();
            let path = request.path.clone();
            let index = engine
                .log
                .record(
                    request,
                    ExchangeResponse {
                        status: status.as_u16(),
                        headers: stored_headers,
                        body: ResponseBody::Chunked(chunks),
                    },
                )
                .await;
            debug!(
                "Recorded streamed exchange #{} {} ({} chunks)",
                index, path, chunk_count
            );
        });

        build_response(status, &headers, Body::from_stream(rx))
    }

    /// Replay mode: answer from the next matching recorded exchange
    async fn replay(&self, window: Arc<ReplayWindow>, raw: RawRequest) -> Response {
        let (request, key) = window.normalizer.key_for(&raw);

        // Matching and logging under one lock keeps the log in match order
        let mut matcher = window.matcher.lock().await;
        match matcher.next_match(&key) {
            Ok(exchange) => {
                self.log.record(request, exchange.response.clone()).await;
                drop(matcher);
                debug!(
                    "Replaying exchange #{} for {}",
                    exchange.sequence_index, raw.path
                );
                replay_response(&exchange.response).unwrap_or_else(|e| {
                    error!("Failed to rebuild recorded response: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
                })
            }
            Err(failure) => {
                drop(matcher);
                warn!(
                    "No recorded exchange in {} matches {} ({} remaining)",
                    window.snapshot_path.display(),
                    failure.observed,
                    failure.remaining
                );
                self.failures.lock().await.push(failure.clone());
                let err = Error::from(failure);
                error_response(status_for(&err), &err)
            }
        }
    }
}

/// Catch-all handler for proxied traffic
///
/// An in-flight request is dropped when the engine shuts down, taking its
/// upstream forward with it.
async fn proxy_handler(State(engine): State<Arc<Engine>>, req: Request) -> Response {
    let shutdown = engine.shutdown_signal();
    tokio::select! {
        response = handle_request(engine, req) => response,
        _ = wait_for_shutdown(shutdown) => {
            debug!("Proxy stopping; dropping in-flight request");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &Error::NotRunning)
        }
    }
}

/// Resolves once the shutdown flag is raised
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_request(engine: Arc<Engine>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match axum::body::to_bytes(body, engine.options.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read request body: {}", e);
            let err = Error::Configuration(format!("Failed to read request body: {e}"));
            return error_response(StatusCode::BAD_REQUEST, &err);
        }
    };

    let raw = RawRequest {
        method: parts.method.to_string(),
        path,
        headers: parts.headers,
        body,
    };
    debug!("Proxying {} {}", raw.method, raw.path);

    let window = engine.window.read().await.clone();
    match window {
        Window::Idle => {
            let err = Error::Configuration(
                "No snapshot configured; call configure before sending requests".to_string(),
            );
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err)
        }
        Window::Recording(recording) => engine.forward(recording, raw).await,
        Window::Replaying(replay) => engine.replay(replay, raw).await,
    }
}

fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            STREAMING_CONTENT_TYPES.iter().any(|s| ct.contains(s))
        })
        .unwrap_or(false)
}

/// Relay status and headers, minus connection-level ones
fn build_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    for (name, value) in headers.iter() {
        if name == header::CONTENT_LENGTH || HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// Rebuild a recorded response, chunk boundaries included
pub(crate) fn replay_response(recorded: &ExchangeResponse) -> Result<Response> {
    let status = StatusCode::from_u16(recorded.status).map_err(|e| {
        Error::Serialization(format!("Invalid recorded status {}: {e}", recorded.status))
    })?;

    let body = match &recorded.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Full(payload) => Body::from(payload.to_bytes()?),
        ResponseBody::Chunked(chunks) => {
            let chunks = chunks
                .iter()
                .map(Payload::to_bytes)
                .collect::<Result<Vec<_>>>()?;
            Body::from_stream(futures::stream::iter(
                chunks.into_iter().map(Ok::<_, std::io::Error>),
            ))
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    for (name, value) in &recorded.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!("Skipping recorded header that cannot be replayed: {}", name),
        }
    }
    Ok(response)
}

/// HTTP status used when an error is reported to a client
pub(crate) fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Configuration(_) => StatusCode::BAD_REQUEST,
        Error::CorruptSnapshot { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::UpstreamForward { .. } => StatusCode::BAD_GATEWAY,
        Error::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        Error::NoMatch { .. }
        | Error::Bind { .. }
        | Error::Io(_)
        | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(status: StatusCode, err: &Error) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "type": err.kind(),
                "message": err.to_string(),
            }
        })),
    )
        .into_response()
}
