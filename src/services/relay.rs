use axum::extract::ws::Message;
use serde_json::Value;
use tracing::{info, trace};

use crate::{
    error::{BridgeError, TransportError},
    services::{rpc::UpstreamRpc, session::DownstreamTx},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayAction {
    Forward,
    SessionClosed,
    Discard,
}

/// How a relay loop that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayEnd {
    SessionClosed,
    DownstreamGone,
}

pub(crate) fn classify(
    raw: &str,
    session_id: &str,
    streams: &[String],
) -> Result<RelayAction, TransportError> {
    let message: Value =
        serde_json::from_str(raw).map_err(|error| TransportError::Malformed(error.to_string()))?;
    let field = |name: &str| message.get(name).and_then(Value::as_str);

    if let Some(stream) = field("streamName") {
        if streams.iter().any(|s| s == stream) {
            return Ok(RelayAction::Forward);
        }
    }

    if field("sid") == Some(session_id) && field("status") == Some("closed") {
        return Ok(RelayAction::SessionClosed);
    }

    Ok(RelayAction::Discard)
}

/// Forwards subscribed telemetry downstream until the upstream session closes.
///
/// Forwarded frames are the original upstream text, never re-serialized.
pub(crate) async fn run_relay(
    rpc: &mut UpstreamRpc,
    session_id: &str,
    streams: &[String],
    downstream: &DownstreamTx,
) -> Result<RelayEnd, BridgeError> {
    let mut forwarded: u64 = 0;

    loop {
        let text = rpc.next_text().await.map_err(BridgeError::Relay)?;

        match classify(text.as_str(), session_id, streams).map_err(BridgeError::Relay)? {
            RelayAction::Forward => {
                if downstream
                    .send(Message::Text(text.as_str().to_string().into()))
                    .is_err()
                {
                    return Ok(RelayEnd::DownstreamGone);
                }
                forwarded += 1;
            }
            RelayAction::SessionClosed => {
                info!(session = session_id, forwarded, "upstream closed the session");
                return Ok(RelayEnd::SessionClosed);
            }
            RelayAction::Discard => trace!(size = text.as_str().len(), "discarding upstream message"),
        }
    }
}
