use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Connection-level failures on the upstream socket.
#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("upstream connection closed")]
    Closed,
    #[error("upstream socket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("malformed upstream frame: {0}")]
    Malformed(String),
    #[error("failed to encode upstream request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timed out waiting for {operation}")]
    TimedOut { operation: String },
}

/// A handshake step answered without error but its postcondition did not hold.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum HandshakeError {
    #[error("access not granted by the headset service; approve this client in the launcher")]
    AccessNotGranted,
    #[error("authorize response carried no token")]
    MissingToken,
    #[error("no headsets found; ensure the headset is on and paired")]
    NoHeadsets,
    #[error("failed to connect headset (status {status}): {message}")]
    DeviceNotConnected { status: String, message: String },
    #[error("createSession response carried no session id")]
    MissingSessionId,
}

#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("upstream error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("relay stopped: {0}")]
    Relay(#[source] TransportError),
}

impl BridgeError {
    pub(crate) fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }
}
