//! One bridged connection: upstream setup, relay, and the cleanup that always
//! follows them.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use serde_json::json;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, HandshakeError},
    services::{
        handshake::{run_handshake, HandshakeProgress, SessionCredentials},
        relay::{run_relay, RelayEnd},
        rpc::UpstreamRpc,
    },
};

pub(crate) type DownstreamTx = mpsc::UnboundedSender<Message>;

pub(crate) const INTERNAL_ERROR_CLOSE_CODE: u16 = 1011;
const NORMAL_CLOSE_CODE: u16 = 1000;
const GOING_AWAY_CLOSE_CODE: u16 = 1001;
/// Close frames carry at most 125 payload bytes, two of which are the code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

const UPDATE_SESSION: &str = "updateSession";

#[derive(Debug)]
pub(crate) enum SessionOutcome {
    UpstreamSessionClosed,
    DownstreamDisconnected,
    ShuttingDown,
    Failed(BridgeError),
}

pub(crate) struct BridgeSession {
    config: Arc<BridgeConfig>,
    upstream: Option<UpstreamRpc>,
    downstream: Option<DownstreamTx>,
    progress: HandshakeProgress,
    cleaned_up: bool,
}

impl BridgeSession {
    pub(crate) fn new(config: Arc<BridgeConfig>, downstream: DownstreamTx) -> Self {
        Self {
            config,
            upstream: None,
            downstream: Some(downstream),
            progress: HandshakeProgress::default(),
            cleaned_up: false,
        }
    }

    pub(crate) async fn establish_and_relay(&mut self) -> SessionOutcome {
        match self.drive().await {
            Ok(RelayEnd::SessionClosed) => SessionOutcome::UpstreamSessionClosed,
            Ok(RelayEnd::DownstreamGone) => SessionOutcome::DownstreamDisconnected,
            Err(error) => SessionOutcome::Failed(error),
        }
    }

    async fn drive(&mut self) -> Result<RelayEnd, BridgeError> {
        let rpc = UpstreamRpc::connect(&self.config.upstream_url, self.config.handshake_timeout)
            .await?;
        info!(upstream = %self.config.upstream_url, "connected to headset service");
        let rpc = self.upstream.insert(rpc);

        run_handshake(rpc, &self.config, &mut self.progress).await?;

        let session_id = self
            .progress
            .credentials
            .as_ref()
            .map(|credentials| credentials.session_id.clone())
            .ok_or(HandshakeError::MissingSessionId)?;
        let Some(downstream) = self.downstream.as_ref() else {
            return Ok(RelayEnd::DownstreamGone);
        };

        run_relay(rpc, &session_id, &self.config.streams, downstream).await
    }

    /// Closes the upstream session and releases every handle. Runs its body
    /// at most once; later calls return immediately.
    pub(crate) async fn cleanup(&mut self, outcome: &SessionOutcome) {
        if self.cleaned_up {
            debug!("cleanup already ran");
            return;
        }
        self.cleaned_up = true;

        let credentials = self.progress.credentials.take();
        if let Some(mut rpc) = self.upstream.take() {
            if let Some(credentials) = credentials {
                close_upstream_session(&mut rpc, &credentials).await;
            }
            if timeout(self.config.handshake_timeout, rpc.close()).await.is_err() {
                warn!("timed out closing upstream connection");
            }
        }

        if let Some(downstream) = self.downstream.take() {
            match outcome {
                SessionOutcome::Failed(error) => notify_failure(&downstream, error),
                SessionOutcome::UpstreamSessionClosed => {
                    let _ = downstream.send(close_message(NORMAL_CLOSE_CODE, "session closed"));
                }
                SessionOutcome::ShuttingDown => {
                    let _ = downstream
                        .send(close_message(GOING_AWAY_CLOSE_CODE, "bridge shutting down"));
                }
                SessionOutcome::DownstreamDisconnected => {}
            }
        }

        self.progress.clear();
        debug!("session resources released");
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if !self.cleaned_up {
            warn!("bridge session dropped without cleanup; upstream session left open");
        }
    }
}

/// Runs one bridged connection to completion.
///
/// Cancelling `disconnect` (the downstream went away) or `shutdown` (the
/// process is stopping) abandons whatever upstream call or read is pending.
/// `disconnect` is normally a child of `shutdown`. Cleanup runs exactly once
/// on every path.
pub(crate) async fn run_session(
    config: Arc<BridgeConfig>,
    downstream: DownstreamTx,
    disconnect: CancellationToken,
    shutdown: CancellationToken,
) -> SessionOutcome {
    let mut session = BridgeSession::new(config, downstream);

    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => SessionOutcome::ShuttingDown,
        _ = disconnect.cancelled() => SessionOutcome::DownstreamDisconnected,
        outcome = session.establish_and_relay() => outcome,
    };

    match &outcome {
        SessionOutcome::UpstreamSessionClosed => info!("upstream session closed, ending stream"),
        SessionOutcome::DownstreamDisconnected => info!("downstream disconnected"),
        SessionOutcome::ShuttingDown => info!("bridge shutting down, ending session"),
        SessionOutcome::Failed(error) => error!(%error, "bridge session failed"),
    }

    session.cleanup(&outcome).await;
    outcome
}

async fn close_upstream_session(rpc: &mut UpstreamRpc, credentials: &SessionCredentials) {
    info!(session = %credentials.session_id, "closing upstream session");
    let params = json!({
        "cortexToken": credentials.token,
        "session": credentials.session_id,
        "status": "close",
    });
    if let Err(error) = rpc.call(UPDATE_SESSION, params).await {
        warn!(%error, "failed to close upstream session");
    }
}

fn notify_failure(downstream: &DownstreamTx, error: &BridgeError) {
    let payload = json!({ "error": format!("Bridge connection failed: {error}") });
    let _ = downstream.send(Message::Text(payload.to_string().into()));
    let _ = downstream.send(close_message(
        INTERNAL_ERROR_CLOSE_CODE,
        &format!("bridge error: {error}"),
    ));
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: truncate_reason(reason).to_string().into(),
    }))
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
