//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::decoder::TransportMeta;
use crate::engine::{Admission, RelayEngine, RelayError};
use crate::gateway::protocol::{event_frame, RuleParams, PROTOCOL_VERSION, SHUTDOWN_EVENT_JSON};
use crate::init;
use crate::rules::{RuleFile, RuleStore};
use crate::transport::{Transport, WebhookTransport};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Header carrying the inbound transport's own message id (used for dedup).
const MESSAGE_ID_HEADER: &str = "X-Message-Id";

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub engine: Arc<RelayEngine>,
    /// Where accepted rule changes are persisted.
    pub rule_file: Arc<RuleFile>,
    /// Held across a rule update and its save so the file always ends on the live version.
    pub rule_lock: Arc<Mutex<()>>,
    /// When Some, inbound posts and rule changes must carry `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
    /// Broadcasts gateway-level frames (e.g. shutdown) to WebSocket clients.
    pub event_tx: broadcast::Sender<String>,
}

impl GatewayState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(ref required) = self.required_token else {
            return true;
        };
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map_or(false, |t| t.trim() == required)
    }
}

/// Build gateway state: restore the persisted rule, create the webhook transport and the engine.
/// The engine's workers are not started.
pub async fn build_state(config: Config, config_path: PathBuf) -> Result<GatewayState> {
    let webhook_url = config
        .outbound
        .webhook_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .context("outbound.webhookUrl is not configured; the gateway has nowhere to send messages")?;
    let transport: Arc<dyn Transport> = Arc::new(WebhookTransport::new(
        webhook_url,
        config::resolve_outbound_token(&config),
    ));

    let rule_file = RuleFile::new(config::resolve_rule_path(&config, &config_path));
    let rules = match rule_file.load().await {
        Some(rule) => {
            log::info!(
                "restored forwarding rule version {} from {}",
                rule.version,
                rule_file.path().display()
            );
            RuleStore::with_rule(rule)
        }
        None => RuleStore::new(),
    };

    let engine = RelayEngine::from_config(&config.relay, Arc::new(rules), transport);
    let (event_tx, _) = broadcast::channel(64);
    Ok(GatewayState {
        required_token: config::resolve_gateway_token(&config),
        config: Arc::new(config),
        engine: Arc::new(engine),
        rule_file: Arc::new(rule_file),
        rule_lock: Arc::new(Mutex::new(())),
        event_tx,
    })
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/inbound", post(inbound_http))
        .route("/rule", get(get_rule_http).put(put_rule_http))
        .route("/tasks", get(tasks_http))
        .route("/events", get(ws_handler))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C), then drains the relay engine.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::resolve_gateway_token(&config).is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.token or FORWARDER_GATEWAY_TOKEN)",
            bind
        );
    }
    let port = config.gateway.port;
    let state = build_state(config, config_path).await?;
    state.engine.start().await;

    let engine = state.engine.clone();
    let event_tx = state.event_tx.clone();
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;

    engine.shutdown().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients before the server drains.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({ "error": message.into() })))
}

/// POST /inbound: raw message payload from the inbound transport.
async fn inbound_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    if !state.authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let mut meta = TransportMeta::now();
    if let Some(id) = headers.get(MESSAGE_ID_HEADER).and_then(|v| v.to_str().ok()) {
        meta = meta.with_message_id(id);
    }
    match state.engine.on_message_received(&body, meta).await {
        Ok(Admission::Queued(id)) => (StatusCode::ACCEPTED, Json(json!({ "taskId": id }))),
        Ok(Admission::Skipped(reason)) => (StatusCode::OK, Json(json!({ "skipped": reason }))),
        Ok(Admission::Duplicate { original }) => (
            StatusCode::OK,
            Json(json!({ "skipped": "duplicate", "taskId": original })),
        ),
        Err(e @ RelayError::Decode(_)) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ RelayError::QueueFull { .. }) => {
            error_body(StatusCode::TOO_MANY_REQUESTS, e.to_string())
        }
        Err(e @ RelayError::ShuttingDown) => {
            error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ RelayError::Config(_)) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /rule: current forwarding rule.
async fn get_rule_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!(state.engine.get_rule()))
}

/// PUT /rule: replace the forwarding rule and persist it.
async fn put_rule_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(params): Json<RuleParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !state.authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let _guard = state.rule_lock.lock().await;
    let target = params
        .target
        .unwrap_or_else(|| state.engine.get_rule().target);
    let rule = match state.engine.set_rule(&target, params.enabled, params.template) {
        Ok(r) => r,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if let Err(e) = state.rule_file.save(&rule).await {
        log::warn!(
            "failed to persist rule to {}: {}",
            state.rule_file.path().display(),
            e
        );
    }
    (StatusCode::OK, Json(json!(rule)))
}

/// GET /tasks: retained tasks and counts.
async fn tasks_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "tasks": state.engine.tasks().await,
        "stats": state.engine.stats().await,
    }))
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let stats = state.engine.stats().await;
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "queued": stats.queued,
        "inFlight": stats.in_flight,
    }))
}

/// GET /events upgrades to WebSocket and streams relay events.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut gateway_rx = state.event_tx.subscribe();
    let mut relay_rx = state.engine.subscribe();
    loop {
        tokio::select! {
            biased;
            frame = gateway_rx.recv() => {
                match frame {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} gateway frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = relay_rx.recv() => {
                match event {
                    Ok(ev) => {
                        if socket.send(Message::Text(event_frame(&ev))).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} relay events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }
}
