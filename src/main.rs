mod config;
mod error;
mod services;

use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use crate::{config::BridgeConfig, services::run_session};

/// How long a finished session may spend flushing its last frames downstream.
const DOWNSTREAM_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long live sessions get to close their upstream sessions on shutdown.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct AppState {
    config: Arc<BridgeConfig>,
    started_at: Instant,
    /// Parent of every session's disconnect token.
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl AppState {
    fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(config.clone()));
    let app = router(state.clone());

    let bind_addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!("failed to bind {bind_addr}: {error}");
            std::process::exit(1);
        }
    };

    info!(
        addr = %bind_addr,
        upstream = %config.upstream_url,
        streams = ?config.streams,
        "cortex bridge listening"
    );

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    // Upgraded sockets outlive `serve`, so live sessions are drained here.
    let served = serve.await;
    drain_sessions(&state, SESSION_DRAIN_TIMEOUT).await;

    if let Err(error) = served {
        error!("server error: {error}");
        std::process::exit(1);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/stream", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Cancels every session and waits for their cleanup, up to `limit`.
async fn drain_sessions(state: &AppState, limit: Duration) {
    state.shutdown.cancel();
    state.sessions.close();
    info!(
        sessions = state.sessions.len(),
        timeout_secs = limit.as_secs(),
        "waiting for sessions to close"
    );

    if tokio::time::timeout(limit, state.sessions.wait())
        .await
        .is_err()
    {
        warn!(
            sessions = state.sessions.len(),
            "shutdown timed out after {limit:?}, some upstream sessions may stay open"
        );
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, no longer accepting connections");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "at": now_iso(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| {
        let span = info_span!("session", %peer);
        sessions.track_future(handle_socket(socket, state).instrument(span))
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("client connected");
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let disconnect = state.shutdown.child_token();

    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if socket_tx.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    // The bridge never acts on client frames; reading only detects disconnects.
    let reader_cancel = disconnect.clone();
    let reader_task = tokio::spawn(
        async move {
            while let Some(message) = socket_rx.next().await {
                match message {
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Text(text)) => {
                        debug!(size = text.as_str().len(), "ignoring client text frame");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!("websocket error: {error}");
                        break;
                    }
                }
            }
            reader_cancel.cancel();
        }
        .in_current_span(),
    );

    run_session(
        state.config.clone(),
        tx,
        disconnect,
        state.shutdown.clone(),
    )
    .await;

    if tokio::time::timeout(DOWNSTREAM_FLUSH_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        warn!("timed out flushing frames to client");
        writer_task.abort();
    }
    reader_task.abort();
    info!("bridge handler complete");
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
