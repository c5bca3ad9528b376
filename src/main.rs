mod bridge;
mod debug_sink;
mod error;
mod sandbox;
mod services;
mod widget;

use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::{
    bridge::{DisplayModeArbiter, HostContextPatch, HostServices},
    debug_sink::DebugSink,
    error::{RpcError, WidgetError},
    sandbox::{proxy::GuestChannel, CspMode, GuestRegistry, OriginResolver},
    services::{
        widget_store::StoreWidgetRequest, HttpBackend, LocationCache, ModelContextStore,
        WidgetStore,
    },
    widget::{LifecycleUpdate, MountRequest, WidgetManager, WidgetSettings},
};

const GUEST_CLAIM_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_DEBUG_LIMIT: usize = 200;

#[derive(Clone)]
struct BridgeConfig {
    host: String,
    port: u16,
    public_origin: String,
    sandbox_origin: Option<String>,
    backend_url: String,
    auth_token: Option<String>,
    auth_enabled: bool,
    allow_insecure_no_auth: bool,
    allow_query_token_auth: bool,
    widget: WidgetSettings,
    debug_capacity: usize,
    geolocation_url: Option<String>,
}

impl BridgeConfig {
    fn from_env() -> Result<Self, String> {
        let host = env::var("BRIDGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("BRIDGE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8787);

        let public_origin = read_env("BRIDGE_PUBLIC_ORIGIN")
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let sandbox_origin = read_env("BRIDGE_SANDBOX_ORIGIN");
        let backend_url =
            read_env("BRIDGE_BACKEND_URL").unwrap_or_else(|| "http://127.0.0.1:6274".to_string());

        let auth_token = read_env("BRIDGE_AUTH_TOKEN");
        let allow_insecure_no_auth = parse_bool_env("BRIDGE_ALLOW_INSECURE_NO_AUTH");
        if auth_token.is_none() && !allow_insecure_no_auth {
            return Err(
                "BRIDGE_AUTH_TOKEN is required. Set BRIDGE_ALLOW_INSECURE_NO_AUTH=true only for local development."
                    .to_string(),
            );
        }

        let auth_enabled = auth_token.is_some();
        let allow_query_token_auth = parse_bool_env("BRIDGE_ALLOW_QUERY_TOKEN_AUTH");

        let defaults = WidgetSettings::default();
        let widget = WidgetSettings {
            partial_input_interval: parse_millis_env(
                "BRIDGE_PARTIAL_INPUT_INTERVAL_MS",
                defaults.partial_input_interval,
            )?,
            reveal_timeout: parse_millis_env("BRIDGE_REVEAL_TIMEOUT_MS", defaults.reveal_timeout)?,
            teardown_timeout: parse_millis_env(
                "BRIDGE_TEARDOWN_TIMEOUT_MS",
                defaults.teardown_timeout,
            )?,
            connect_timeout: defaults.connect_timeout,
        };

        let debug_capacity = match read_env("BRIDGE_DEBUG_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|capacity| *capacity > 0)
                .ok_or_else(|| format!("BRIDGE_DEBUG_CAPACITY must be a positive integer, got {raw:?}"))?,
            None => 1000,
        };

        Ok(Self {
            host,
            port,
            public_origin,
            sandbox_origin,
            backend_url,
            auth_token,
            auth_enabled,
            allow_insecure_no_auth,
            allow_query_token_auth,
            widget,
            debug_capacity,
            geolocation_url: read_env("BRIDGE_GEOLOCATION_URL"),
        })
    }

    fn is_authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        if !self.auth_enabled {
            return true;
        }

        let expected = match &self.auth_token {
            Some(token) => token,
            None => return false,
        };

        if let Some(value) = headers.get("authorization") {
            if let Ok(raw) = value.to_str() {
                if let Some(token) = raw.strip_prefix("Bearer ") {
                    if token.trim() == expected {
                        return true;
                    }
                }
            }
        }

        if self.allow_query_token_auth {
            if let Some(token) = query_token {
                if token == expected {
                    return true;
                }
            }
        }

        false
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    hub: Arc<ClientHub>,
    resolver: Arc<OriginResolver>,
    registry: Arc<GuestRegistry>,
    store: Arc<WidgetStore>,
    widgets: Arc<WidgetManager>,
}

struct ClientHub {
    next_client_id: AtomicU64,
    clients: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
}

impl ClientHub {
    fn new() -> Self {
        Self {
            next_client_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn add_client(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(id, tx);
        id
    }

    async fn remove_client(&self, client_id: u64) {
        self.clients.write().await.remove(&client_id);
    }

    async fn send_json(&self, client_id: u64, value: Value) {
        let text = match serde_json::to_string(&value) {
            Ok(v) => v,
            Err(error) => {
                error!("failed to serialize websocket payload: {error}");
                return;
            }
        };

        let clients = self.clients.read().await;
        if let Some(tx) = clients.get(&client_id) {
            let _ = tx.send(Message::Text(text.into()));
        }
    }

    async fn broadcast_json(&self, value: Value) {
        let text = match serde_json::to_string(&value) {
            Ok(v) => v,
            Err(error) => {
                error!("failed to serialize broadcast payload: {error}");
                return;
            }
        };

        let clients = self.clients.read().await;
        for tx in clients.values() {
            let _ = tx.send(Message::Text(text.clone().into()));
        }
    }

    async fn broadcast_notification(&self, method: &str, params: Value) {
        self.broadcast_json(json!({
            "method": method,
            "params": params
        }))
        .await;
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentQuery {
    token: Option<String>,
    csp_mode: Option<CspMode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetParams {
    tool_call_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LifecycleParams {
    tool_call_id: String,
    #[serde(flatten)]
    update: LifecycleUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostContextParams {
    tool_call_id: String,
    #[serde(flatten)]
    patch: HostContextPatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CspModeParams {
    tool_call_id: String,
    csp_mode: CspMode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugEntriesParams {
    tool_call_id: Option<String>,
    limit: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };

    if !config.auth_enabled && config.allow_insecure_no_auth {
        warn!(
            "bridge auth is disabled by BRIDGE_ALLOW_INSECURE_NO_AUTH=true (local development only)"
        );
    }
    if config.allow_query_token_auth {
        warn!(
            "query-token auth is enabled (BRIDGE_ALLOW_QUERY_TOKEN_AUTH=true); prefer Authorization headers instead"
        );
    }

    let state = match build_state(config.clone()) {
        Ok(state) => state,
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };
    match state.resolver.sandbox_origin() {
        Ok(origin) => info!(host_origin = %config.public_origin, sandbox_origin = %origin, "sandbox origin resolved"),
        Err(error) => warn!("{error}; widgets cannot be mounted until BRIDGE_SANDBOX_ORIGIN is set"),
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!("failed to bind {bind_addr}: {error}");
            std::process::exit(1);
        }
    };

    info!("widget-bridge listening on {bind_addr}");

    if let Err(error) = axum::serve(listener, build_router(state)).await {
        error!("server error: {error}");
        std::process::exit(1);
    }
}

fn build_state(config: Arc<BridgeConfig>) -> Result<Arc<AppState>, String> {
    let backend = HttpBackend::new(&config.backend_url, config.auth_token.clone())
        .map_err(|error| format!("failed to create backend client: {error}"))?;
    let backend = Arc::new(backend);

    let hub = Arc::new(ClientHub::new());
    let resolver = Arc::new(OriginResolver::new(
        config.public_origin.clone(),
        config.sandbox_origin.clone(),
    ));
    let registry = Arc::new(GuestRegistry::default());
    let store = Arc::new(WidgetStore::new(backend.clone()));
    let services = HostServices {
        backend,
        arbiter: Arc::new(DisplayModeArbiter::new()),
        model_context: Arc::new(ModelContextStore::default()),
        debug: Arc::new(DebugSink::new(config.debug_capacity)),
    };

    forward_notifications(
        hub.clone(),
        "bridge/debug/entry",
        services.debug.subscribe(),
    );
    let widgets = Arc::new(WidgetManager::new(
        resolver.clone(),
        registry.clone(),
        store.clone(),
        services,
        Arc::new(LocationCache::new(config.geolocation_url.clone())),
        config.widget,
    ));
    forward_notifications(hub.clone(), "widget/event", widgets.subscribe());

    Ok(Arc::new(AppState {
        config,
        started_at: Instant::now(),
        hub,
        resolver,
        registry,
        store,
        widgets,
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/mcp/apps/widget/store", post(store_widget_handler))
        .route(
            "/api/mcp/apps/widget-content/{tool_id}",
            get(widget_content_handler),
        )
        .route("/sandbox/{tool_call_id}/document", get(sandbox_document_handler))
        .route("/sandbox/{tool_call_id}/channel", get(sandbox_channel_handler))
        .with_state(state)
}

/// Relays a broadcast stream to every `/rpc` client as `method` notifications.
fn forward_notifications<T>(hub: Arc<ClientHub>, method: &'static str, mut rx: broadcast::Receiver<T>)
where
    T: Serialize + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => match serde_json::to_value(&item) {
                    Ok(params) => hub.broadcast_notification(method, params).await,
                    Err(error) => error!(method, "failed to serialize notification: {error}"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(method, skipped, "notification forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "at": now_iso(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

async fn store_widget_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<StoreWidgetRequest>,
) -> Response {
    if !state.config.is_authorized(&headers, query.token.as_deref()) {
        return unauthorized();
    }
    match state.store.store(request).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(error) => widget_error_response(error),
    }
}

async fn widget_content_handler(
    State(state): State<Arc<AppState>>,
    Path(tool_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ContentQuery>,
) -> Response {
    if !state.config.is_authorized(&headers, query.token.as_deref()) {
        return unauthorized();
    }
    match state.store.content(&tool_id, query.csp_mode).await {
        Ok(content) => Json(content).into_response(),
        Err(error) => widget_error_response(error),
    }
}

/// Serves the guest document created by the proxy. Only reachable through
/// the sandbox origin; the policy is repeated as a response header so it
/// holds even before the meta tag is parsed.
async fn sandbox_document_handler(
    State(state): State<Arc<AppState>>,
    Path(tool_call_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = ensure_sandbox_host(&state, &headers) {
        return response;
    }
    let Some(document) = state.registry.document(&tool_call_id).await else {
        return (StatusCode::NOT_FOUND, "no guest document").into_response();
    };

    debug!(
        %tool_call_id,
        guest_origin = %document.origin,
        allow = %document.allow,
        "serving guest document"
    );
    let policy = format!("{}; sandbox {}", document.policy, document.sandbox);
    let mut response = document.document.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    match header::HeaderValue::from_str(&policy) {
        Ok(value) => {
            headers.insert(header::CONTENT_SECURITY_POLICY, value);
        }
        Err(error) => {
            warn!(%tool_call_id, "policy is not a valid header value: {error}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "invalid policy").into_response();
        }
    }
    response
}

async fn sandbox_channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(tool_call_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = ensure_sandbox_host(&state, &headers) {
        return response;
    }
    let Some(channel) = state.registry.claim(&tool_call_id, GUEST_CLAIM_WAIT).await else {
        return (StatusCode::NOT_FOUND, "no guest frame").into_response();
    };

    ws.on_upgrade(move |socket| handle_guest_socket(socket, tool_call_id, channel))
        .into_response()
}

/// Binds a real guest document to its window: socket frames are posted to
/// the proxy, and whatever the proxy posts to the guest goes down the socket.
async fn handle_guest_socket(socket: WebSocket, tool_call_id: String, mut channel: GuestChannel) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    info!(%tool_call_id, "guest channel attached");

    loop {
        tokio::select! {
            event = channel.mailbox.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event.data) {
                    Ok(text) => text,
                    Err(error) => {
                        error!(%tool_call_id, "failed to serialize guest message: {error}");
                        continue;
                    }
                };
                if socket_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = socket_rx.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(data) => {
                        channel.post_to_parent(data);
                    }
                    Err(error) => debug!(%tool_call_id, "dropping unparsable guest frame: {error}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%tool_call_id, "guest websocket error: {error}");
                    break;
                }
            },
        }
    }

    info!(%tool_call_id, "guest channel detached");
}

fn ensure_sandbox_host(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let sandbox_origin = state.resolver.sandbox_origin().map_err(widget_error_response)?;
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if matches_origin_host(&sandbox_origin, host) {
        return Ok(());
    }
    warn!(%host, %sandbox_origin, "refusing sandbox request outside the sandbox origin");
    Err((
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "wrong_origin",
            "message": "Sandbox content is only served from the sandbox origin"
        })),
    )
        .into_response())
}

fn matches_origin_host(origin: &str, host_header: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let expected = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    host_header.eq_ignore_ascii_case(&expected)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if !state.config.is_authorized(&headers, query.token.as_deref()) {
        return unauthorized();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = state.hub.add_client(tx).await;

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    state
        .hub
        .send_json(
            client_id,
            json!({
                "method": "bridge/connection/state",
                "params": {
                    "status": "connected",
                    "at": now_iso(),
                }
            }),
        )
        .await;

    while let Some(message) = socket_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_message(client_id, text.to_string(), &state).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                send_rpc_error(
                    &state,
                    client_id,
                    Value::Null,
                    RpcError::new(-32600, "Binary websocket messages are not supported"),
                )
                .await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(error) => {
                warn!("websocket error: {error}");
                break;
            }
        }
    }

    state.hub.remove_client(client_id).await;
    writer_task.abort();
}

async fn handle_client_message(client_id: u64, text: String, state: &Arc<AppState>) {
    let parsed = match serde_json::from_str::<Value>(&text) {
        Ok(value) => value,
        Err(error) => {
            send_rpc_error(
                state,
                client_id,
                Value::Null,
                RpcError::new(-32700, format!("Parse error: {error}")),
            )
            .await;
            return;
        }
    };

    let Some(object) = parsed.as_object() else {
        send_rpc_error(
            state,
            client_id,
            Value::Null,
            RpcError::new(-32600, "Invalid request payload"),
        )
        .await;
        return;
    };

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        send_rpc_error(
            state,
            client_id,
            object.get("id").cloned().unwrap_or(Value::Null),
            RpcError::new(-32600, "Missing method"),
        )
        .await;
        return;
    };

    let Some(id) = object.get("id").cloned() else {
        debug!(method, "ignoring client notification");
        return;
    };

    let params = object.get("params").cloned();
    match handle_method(method, params, state).await {
        Ok(result) => {
            state
                .hub
                .send_json(client_id, json!({ "id": id, "result": result }))
                .await;
        }
        Err(error) => send_rpc_error(state, client_id, id, error).await,
    }
}

async fn handle_method(
    method: &str,
    params: Option<Value>,
    state: &Arc<AppState>,
) -> Result<Value, RpcError> {
    match method {
        "bridge/health/read" => Ok(json!({
            "status": "ok",
            "at": now_iso(),
            "uptimeSec": state.started_at.elapsed().as_secs(),
            "hostOrigin": state.resolver.host_origin(),
            "sandboxOrigin": state.resolver.sandbox_origin().ok(),
            "widgets": state.widgets.mounted().await,
        })),
        "widget/mount" => {
            let request: MountRequest = parse_params(params)?;
            to_result(state.widgets.mount(request).await?)
        }
        "widget/lifecycle" => {
            let params: LifecycleParams = parse_params(params)?;
            to_result(
                state
                    .widgets
                    .lifecycle(&params.tool_call_id, params.update)
                    .await?,
            )
        }
        "widget/hostContext" => {
            let params: HostContextParams = parse_params(params)?;
            to_result(
                state
                    .widgets
                    .host_context(&params.tool_call_id, params.patch)
                    .await?,
            )
        }
        "widget/cspMode" => {
            let params: CspModeParams = parse_params(params)?;
            to_result(
                state
                    .widgets
                    .set_csp_mode(&params.tool_call_id, params.csp_mode)
                    .await?,
            )
        }
        "widget/unmount" => {
            let params: WidgetParams = parse_params(params)?;
            to_result(state.widgets.unmount(&params.tool_call_id).await?)
        }
        "widget/violations" => {
            let params: WidgetParams = parse_params(params)?;
            let violations = state.widgets.violations(&params.tool_call_id).await?;
            Ok(json!({ "violations": violations }))
        }
        "widget/modelContext" => {
            let params: WidgetParams = parse_params(params)?;
            let entry = state
                .widgets
                .services()
                .model_context
                .get(&params.tool_call_id)
                .await;
            to_result(entry)
        }
        "display/state" => to_result(state.widgets.services().arbiter.holders().await),
        "debug/entries" => {
            let params: DebugEntriesParams = parse_params(params)?;
            let entries = state.widgets.services().debug.entries(
                params.tool_call_id.as_deref(),
                params.limit.unwrap_or(DEFAULT_DEBUG_LIMIT),
            );
            Ok(json!({ "entries": entries }))
        }
        _ => Err(RpcError::method_not_found(&format!(
            "Unknown bridge method: {method}"
        ))),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|error| RpcError::invalid_params(&error.to_string()))
}

fn to_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|error| RpcError::server(&error.to_string()))
}

async fn send_rpc_error(state: &Arc<AppState>, client_id: u64, id: Value, error: RpcError) {
    state
        .hub
        .send_json(client_id, json!({ "id": id, "error": error }))
        .await;
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": "Missing or invalid bridge token"
        })),
    )
        .into_response()
}

fn widget_error_response(error: WidgetError) -> Response {
    let status = match &error {
        WidgetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        WidgetError::NotFound(_) => StatusCode::NOT_FOUND,
        WidgetError::ModelOnlyTool(_) => StatusCode::FORBIDDEN,
        WidgetError::IllegalState { .. } => StatusCode::CONFLICT,
        WidgetError::Backend(_) | WidgetError::Connection(_) => StatusCode::BAD_GATEWAY,
        WidgetError::Configuration { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = RpcError::from(error);
    (
        status,
        Json(json!({ "error": body.data, "message": body.message })),
    )
        .into_response()
}

fn read_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_millis_env(name: &str, fallback: Duration) -> Result<Duration, String> {
    match read_env(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("{name} must be a number of milliseconds, got {raw:?}")),
        None => Ok(fallback),
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
