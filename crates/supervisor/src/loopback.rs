//! In-process loopback HTTP server the runtime calls back into for custom
//! service bindings, log ingestion, pretty-error resolution, and live-reload
//! (spec §4.8, §6 "Loopback URL shape").
//!
//! Built with `axum`, workspace-aligned with `config-encryption`'s and
//! `control-plane-api`'s HTTP servers (SPEC_FULL.md §6).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use miniflare_core::{LogLevel, LogRecord};
use tokio::sync::{broadcast, Mutex};

use crate::reload::ReloadBus;

/// Handles one custom service binding's dispatch (spec §4.8 "a header
/// selects `<workerIndex>/<kind><serviceName>`; the call delegates to the
/// user-provided function").
#[async_trait]
pub trait CustomServiceHandler: Send + Sync {
    async fn call(&self, headers: HeaderMap, body: Bytes) -> Response;
}

/// Handles one plugin-local binding call (`GET /<plugin>/<path>`), keyed by
/// `NamespaceId::sanitised_label()` for storage plugins.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn call(&self, path: &str, headers: HeaderMap) -> Response;
}

#[derive(Clone)]
pub struct LoopbackState {
    log_tx: broadcast::Sender<LogRecord>,
    custom_services: Arc<Mutex<HashMap<String, Arc<dyn CustomServiceHandler>>>>,
    plugins: Arc<Mutex<HashMap<String, Arc<dyn PluginHandler>>>>,
    reload: ReloadBus,
}

impl LoopbackState {
    pub fn new(reload: ReloadBus) -> Self {
        let (log_tx, _) = broadcast::channel(256);
        Self {
            log_tx,
            custom_services: Arc::new(Mutex::new(HashMap::new())),
            plugins: Arc::new(Mutex::new(HashMap::new())),
            reload,
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRecord> {
        self.log_tx.subscribe()
    }

    pub async fn register_custom_service(&self, key: impl Into<String>, handler: Arc<dyn CustomServiceHandler>) {
        self.custom_services.lock().await.insert(key.into(), handler);
    }

    pub async fn register_plugin(&self, key: impl Into<String>, handler: Arc<dyn PluginHandler>) {
        self.plugins.lock().await.insert(key.into(), handler);
    }
}

pub fn router(state: LoopbackState) -> AxumRouter {
    AxumRouter::new()
        .route("/core/log", post(ingest_log))
        .route("/core/error", get(resolve_error))
        .route("/cf/:idx/:kind/:name", get(custom_service_dispatch))
        .route("/:plugin/*path", get(plugin_dispatch))
        .route("/cdn-cgi/mf/reload", get(reload_websocket))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn ingest_log(State(state): State<LoopbackState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let level = headers
        .get("mf-log-level")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u8>().ok())
        .and_then(LogLevel::from_header)
        .unwrap_or(LogLevel::Info);
    let message = String::from_utf8_lossy(&body).into_owned();

    match level {
        LogLevel::Error => tracing::error!(%message, "runtime log"),
        LogLevel::Warn => tracing::warn!(%message, "runtime log"),
        LogLevel::Info => tracing::info!(%message, "runtime log"),
        LogLevel::Debug => tracing::debug!(%message, "runtime log"),
        LogLevel::Trace => tracing::trace!(%message, "runtime log"),
        LogLevel::Not => {}
    }

    if level != LogLevel::Not {
        let _ = state.log_tx.send(LogRecord {
            level,
            message,
            fields: Default::default(),
        });
    }

    StatusCode::NO_CONTENT
}

/// Pretty error rendering lives outside this crate's scope (spec §1
/// Non-goals); the endpoint exists so the runtime's callback succeeds, but it
/// cannot map source locations on its own.
async fn resolve_error() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, "pretty error rendering is out of scope")
}

async fn custom_service_dispatch(
    State(state): State<LoopbackState>,
    Path((idx, kind, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = format!("{idx}/{kind}{name}");
    let handler = state.custom_services.lock().await.get(&key).cloned();
    match handler {
        Some(handler) => handler.call(headers, body).await,
        None => (StatusCode::NOT_FOUND, format!("no custom service registered for {key}")).into_response(),
    }
}

async fn plugin_dispatch(
    State(state): State<LoopbackState>,
    Path((plugin, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let handler = state.plugins.lock().await.get(&plugin).cloned();
    match handler {
        Some(handler) => handler.call(&path, headers).await,
        None => (StatusCode::NOT_FOUND, format!("no plugin registered for {plugin}")).into_response(),
    }
}

async fn reload_websocket(State(state): State<LoopbackState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_reload_socket(socket, state))
}

async fn handle_reload_socket(mut socket: WebSocket, state: LoopbackState) {
    let mut rx = state.reload.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let payload = format!("{{\"generation\":{}}}", event.generation);
                        if socket.send(Message::Text(payload)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}
