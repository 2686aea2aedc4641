use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        ConnectInfo, DefaultBodyLimit, Multipart, RawQuery, Request, State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::bot::{Document, Pusher};
use crate::config::Config;
use crate::dispatch::{fan_out, parse_recipients};

/// Header carrying the shared push token
pub const TOKEN_HEADER: &str = "X-Token";

/// Bot API upload ceiling
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pusher: Arc<dyn Pusher>,
}

impl AppState {
    pub fn new(config: Config, pusher: Arc<dyn Pusher>) -> Self {
        Self {
            config: Arc::new(config),
            pusher,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────────────

/// Reasons a push request is rejected before anything is dispatched
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("bad request type")]
    BadType,
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("malformed request body: {0}")]
    Malformed(String),
    #[error("request body too large")]
    TooLarge,
    #[error("receive {0} failed")]
    Receive(&'static str),
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status = match self {
            PushError::Receive(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PushError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

fn require_type(value: &str, expected: &str) -> Result<(), PushError> {
    if value.trim() == expected {
        Ok(())
    } else {
        Err(PushError::BadType)
    }
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, PushError> {
    let value = value.trim();
    if value.is_empty() {
        Err(PushError::Empty(field))
    } else {
        Ok(value)
    }
}

// ── Router ─────────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    router_with_limit(state, MAX_UPLOAD_BYTES)
}

fn router_with_limit(state: AppState, body_limit: usize) -> Router {
    let push = Router::new()
        .route("/txt", post(push_txt))
        .route("/file", post(push_file))
        .route("/image", post(push_image))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/push", push)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// ── Auth ───────────────────────────────────────────────────────────────────────

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|token| constant_time_eq(token.as_bytes(), state.config.token.as_bytes()))
        .unwrap_or(false);

    if authorized {
        return next.run(req).await;
    }

    warn!("Forbidden: IP[{}], URI[{}]", client_addr(&req), req.uri());
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

fn client_addr(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Form fields ────────────────────────────────────────────────────────────────

/// Request fields gathered from the body and the query string.
///
/// The first value seen for a key wins, and body fields are collected before
/// query fields, so the body takes precedence.
#[derive(Debug, Default)]
struct FormFields(HashMap<String, String>);

impl FormFields {
    fn insert(&mut self, name: String, value: String) {
        self.0.entry(name).or_insert(value);
    }

    fn extend_urlencoded(&mut self, input: &[u8]) {
        for (name, value) in url::form_urlencoded::parse(input) {
            self.insert(name.into_owned(), value.into_owned());
        }
    }

    fn extend_query(&mut self, query: Option<&str>) {
        if let Some(query) = query {
            self.extend_urlencoded(query.as_bytes());
        }
    }

    fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or("")
    }
}

fn is_urlencoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

// ── Push handlers ──────────────────────────────────────────────────────────────

async fn push_txt(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, PushError> {
    let mut form = FormFields::default();
    // Non-form bodies are ignored; the query string may still carry the fields
    if is_urlencoded(&headers) {
        form.extend_urlencoded(&body);
    }
    form.extend_query(query.as_deref());

    require_type(form.get("type"), "txt")?;
    let message: Arc<str> = Arc::from(required(form.get("message"), "message")?);
    let to = required(form.get("recipient"), "recipient")?;
    let markdown = form.get("markdown").trim() == "true";

    let recipients = parse_recipients("txt", to);
    let pusher = state.pusher.clone();
    let started = fan_out("txt", &recipients, |id| {
        let pusher = pusher.clone();
        let message = message.clone();
        async move { pusher.send_text(id, &message, markdown).await }
    });
    debug!("[txt] dispatched {} send(s)", started);

    Ok(StatusCode::OK)
}

/// Text fields plus the single upload part of a multipart push
#[derive(Default)]
struct MultipartForm {
    fields: FormFields,
    upload: Option<Bytes>,
}

impl MultipartForm {
    fn field(&self, name: &str) -> &str {
        self.fields.get(name)
    }

    fn upload(&self, name: &'static str) -> Result<Bytes, PushError> {
        self.upload
            .clone()
            .filter(|data| !data.is_empty())
            .ok_or(PushError::Empty(name))
    }
}

/// Map a multipart read error, keeping the body-limit case a client error.
fn multipart_error(e: &MultipartError, otherwise: PushError) -> PushError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PushError::TooLarge
    } else {
        otherwise
    }
}

async fn read_multipart(
    kind: &'static str,
    query: Option<&str>,
    multipart: Result<Multipart, MultipartRejection>,
    upload_field: &'static str,
) -> Result<MultipartForm, PushError> {
    let mut multipart = multipart.map_err(|e| {
        error!("[{}] {}", kind, e);
        PushError::Malformed(e.to_string())
    })?;

    let mut form = MultipartForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                error!("[{}] {}", kind, e);
                return Err(multipart_error(&e, PushError::Malformed(e.to_string())));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == upload_field {
            let data = field.bytes().await.map_err(|e| {
                error!("[{}] receive {} failed: {}", kind, upload_field, e);
                multipart_error(&e, PushError::Receive(upload_field))
            })?;
            if form.upload.is_none() {
                form.upload = Some(data);
            }
        } else {
            let value = field.text().await.map_err(|e| {
                error!("[{}] read field {} failed: {}", kind, name, e);
                multipart_error(&e, PushError::Malformed(e.to_string()))
            })?;
            form.fields.insert(name, value);
        }
    }
    form.fields.extend_query(query);

    Ok(form)
}

async fn push_file(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, PushError> {
    let form = read_multipart("file", query.as_deref(), multipart, "file").await?;

    require_type(form.field("type"), "file")?;
    let file_name = required(form.field("filename"), "filename")?.to_string();
    let data = form.upload("file")?;
    let mime = Some(form.field("mime").trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let caption = form.field("caption").trim().to_string();
    let to = required(form.field("recipient"), "recipient")?;

    let document = Document {
        data,
        file_name,
        mime,
        caption,
    };

    let recipients = parse_recipients("file", to);
    let pusher = state.pusher.clone();
    let started = fan_out("file", &recipients, |id| {
        let pusher = pusher.clone();
        let document = document.clone();
        async move { pusher.send_file(id, document).await }
    });
    debug!(
        "[file] dispatched {} ({} bytes) to {} recipient(s)",
        document.file_name,
        document.data.len(),
        started
    );

    Ok(StatusCode::OK)
}

async fn push_image(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, PushError> {
    let form = read_multipart("image", query.as_deref(), multipart, "image").await?;

    // Image pushes share the `file` discriminator with file pushes
    require_type(form.field("type"), "file")?;
    let image = form.upload("image")?;
    let caption: Arc<str> = Arc::from(form.field("caption").trim());
    let to = required(form.field("recipient"), "recipient")?;

    let recipients = parse_recipients("image", to);
    let pusher = state.pusher.clone();
    let started = fan_out("image", &recipients, |id| {
        let pusher = pusher.clone();
        let image = image.clone();
        let caption = caption.clone();
        async move { pusher.send_image(id, image, &caption).await }
    });
    debug!("[image] dispatched {} send(s)", started);

    Ok(StatusCode::OK)
}

// ── Lifecycle ──────────────────────────────────────────────────────────────────

/// Fires the graceful-shutdown channel at most once.
pub struct Shutdown {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Shutdown {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns `true` only for the call that actually started the shutdown.
    pub async fn trigger(&self) -> bool {
        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Turn every received termination signal into a shutdown attempt.
async fn relay_signals(mut signals: mpsc::Receiver<()>, shutdown: Shutdown) {
    while signals.recv().await.is_some() {
        warn!("Receiving the termination signal, graceful shutdown...");
        if !shutdown.trigger().await {
            debug!("Shutdown already in progress");
        }
    }
}

#[cfg(unix)]
async fn forward_signals(tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

    loop {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        if tx.send(()).await.is_err() {
            return;
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(tx: mpsc::Sender<()>) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        if tx.send(()).await.is_err() {
            return;
        }
    }
}

/// Resolves once the shutdown trigger fires.
async fn shutdown_requested(rx: oneshot::Receiver<()>) {
    // A dropped sender means signal handling failed; keep serving
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Serve the push API until a termination signal arrives.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Server listening at {}", addr);

    let (shutdown, shutdown_rx) = Shutdown::new();
    let (signal_tx, signal_rx) = mpsc::channel(4);
    tokio::spawn(forward_signals(signal_tx));
    tokio::spawn(relay_signals(signal_rx, shutdown));

    serve_with(listener, state, shutdown_requested(shutdown_rx)).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    info!("server shutdown success.");
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
