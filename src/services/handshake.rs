//! Six-step session setup against the headset service.
//!
//! Each state names the call it is about to make. [`advance`] performs that
//! call, checks its postcondition and returns the next state. The first
//! failure ends the handshake; nothing is retried.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, HandshakeError},
    services::rpc::UpstreamRpc,
};

const REQUEST_ACCESS: &str = "requestAccess";
const AUTHORIZE: &str = "authorize";
const QUERY_HEADSETS: &str = "queryHeadsets";
const CONTROL_DEVICE: &str = "controlDevice";
const CREATE_SESSION: &str = "createSession";
const SUBSCRIBE: &str = "subscribe";

/// Token and session id, only ever stored as a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionCredentials {
    pub(crate) token: String,
    pub(crate) session_id: String,
}

/// What the handshake has obtained so far, kept by the owning session so that
/// cleanup can see partial progress.
#[derive(Debug, Default)]
pub(crate) struct HandshakeProgress {
    pub(crate) headset_id: Option<String>,
    pub(crate) credentials: Option<SessionCredentials>,
}

impl HandshakeProgress {
    pub(crate) fn clear(&mut self) {
        self.headset_id = None;
        self.credentials = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Idle,
    RequestingAccess,
    Authorizing,
    QueryingDevices { token: String },
    ConnectingDevice { token: String, headset_id: String },
    CreatingSession { token: String, headset_id: String },
    Subscribing,
    Streaming,
}

impl HandshakeState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingAccess => "requesting_access",
            Self::Authorizing => "authorizing",
            Self::QueryingDevices { .. } => "querying_devices",
            Self::ConnectingDevice { .. } => "connecting_device",
            Self::CreatingSession { .. } => "creating_session",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
        }
    }
}

/// Drives the state machine from `Idle` until `Streaming` or the first error.
pub(crate) async fn run_handshake(
    rpc: &mut UpstreamRpc,
    config: &BridgeConfig,
    progress: &mut HandshakeProgress,
) -> Result<(), BridgeError> {
    let mut state = HandshakeState::Idle;

    while state != HandshakeState::Streaming {
        let step = state.name();
        match advance(state, rpc, config, progress).await {
            Ok(next) => {
                debug!(from = step, to = next.name(), "handshake advanced");
                state = next;
            }
            Err(error) => {
                warn!(state = step, %error, "handshake failed");
                return Err(error);
            }
        }
    }

    info!(streams = ?config.streams, "subscribed, streaming telemetry");
    Ok(())
}

pub(crate) async fn advance(
    state: HandshakeState,
    rpc: &mut UpstreamRpc,
    config: &BridgeConfig,
    progress: &mut HandshakeProgress,
) -> Result<HandshakeState, BridgeError> {
    match state {
        HandshakeState::Idle => Ok(HandshakeState::RequestingAccess),
        HandshakeState::RequestingAccess => {
            let response = rpc.call(REQUEST_ACCESS, client_credentials(config)).await?;
            if response.result().get("accessGranted").and_then(Value::as_bool) != Some(true) {
                return Err(HandshakeError::AccessNotGranted.into());
            }
            Ok(HandshakeState::Authorizing)
        }
        HandshakeState::Authorizing => {
            let response = rpc.call(AUTHORIZE, client_credentials(config)).await?;
            let token = non_empty_string(response.result().get("cortexToken"))
                .ok_or(HandshakeError::MissingToken)?;
            info!(token = %token_preview(&token), "authorized with headset service");
            Ok(HandshakeState::QueryingDevices { token })
        }
        HandshakeState::QueryingDevices { token } => {
            let response = rpc.call(QUERY_HEADSETS, json!({})).await?;
            let headset_id = response
                .result()
                .as_array()
                .and_then(|headsets| headsets.first())
                .and_then(|headset| non_empty_string(headset.get("id")))
                .ok_or(HandshakeError::NoHeadsets)?;
            info!(headset = %headset_id, "found headset");
            progress.headset_id = Some(headset_id.clone());
            Ok(HandshakeState::ConnectingDevice { token, headset_id })
        }
        HandshakeState::ConnectingDevice { token, headset_id } => {
            let response = rpc
                .call(
                    CONTROL_DEVICE,
                    json!({ "command": "connect", "headset": headset_id }),
                )
                .await?;
            let result = response.result();
            let status = result.get("status").and_then(Value::as_str);
            if status != Some("connected") {
                return Err(HandshakeError::DeviceNotConnected {
                    status: status.unwrap_or("missing").to_string(),
                    message: result
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown")
                        .to_string(),
                }
                .into());
            }
            info!(headset = %headset_id, "headset connected");
            Ok(HandshakeState::CreatingSession { token, headset_id })
        }
        HandshakeState::CreatingSession { token, headset_id } => {
            let response = rpc
                .call(
                    CREATE_SESSION,
                    json!({
                        "cortexToken": token,
                        "headset": headset_id,
                        "status": "active",
                    }),
                )
                .await?;
            let session_id = non_empty_string(response.result().get("id"))
                .ok_or(HandshakeError::MissingSessionId)?;
            info!(session = %session_id, "upstream session created");
            progress.credentials = Some(SessionCredentials { token, session_id });
            Ok(HandshakeState::Subscribing)
        }
        HandshakeState::Subscribing => {
            let credentials = progress
                .credentials
                .as_ref()
                .ok_or(HandshakeError::MissingSessionId)?;
            rpc.call(
                SUBSCRIBE,
                json!({
                    "cortexToken": credentials.token,
                    "session": credentials.session_id,
                    "streams": config.streams,
                }),
            )
            .await?;
            Ok(HandshakeState::Streaming)
        }
        HandshakeState::Streaming => Ok(HandshakeState::Streaming),
    }
}

fn client_credentials(config: &BridgeConfig) -> Value {
    json!({
        "clientId": config.client_id,
        "clientSecret": config.client_secret,
    })
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{prefix}...")
}
