use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message, Utf8Bytes},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::error::{BridgeError, TransportError};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcResponse {
    #[serde(default)]
    pub(crate) result: Option<Value>,
    #[serde(default)]
    pub(crate) error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub(crate) fn result(&self) -> &Value {
        self.result.as_ref().unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcErrorObject {
    #[serde(default)]
    pub(crate) code: i64,
    #[serde(default)]
    pub(crate) message: String,
}

/// JSON-RPC client over one upstream WebSocket, owned by a single session.
///
/// Calls take `&mut self`, so at most one request is in flight at a time.
pub(crate) struct UpstreamRpc {
    socket: UpstreamSocket,
    last_request_id: u64,
    call_timeout: Duration,
}

impl UpstreamRpc {
    pub(crate) async fn connect(url: &str, call_timeout: Duration) -> Result<Self, TransportError> {
        let (socket, _) = timeout(call_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::TimedOut {
                operation: format!("connection to {url}"),
            })??;

        Ok(Self {
            socket,
            last_request_id: 0,
            call_timeout,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        self.last_request_id += 1;
        self.last_request_id
    }

    /// Sends `method` and waits for the response carrying the same id.
    ///
    /// Unsolicited events and responses to other ids that arrive first are
    /// logged and skipped. The whole exchange is bounded by the call timeout.
    pub(crate) async fn call(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse, BridgeError> {
        let id = self.allocate_id();
        let payload = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
        })
        .map_err(TransportError::from)?;

        debug!(method, id, "sending upstream request");
        let response = timeout(self.call_timeout, self.exchange(id, payload))
            .await
            .map_err(|_| TransportError::TimedOut {
                operation: format!("`{method}` response"),
            })??;

        if let Some(error) = response.error {
            return Err(BridgeError::rpc(error.code, error.message));
        }

        Ok(response)
    }

    async fn exchange(&mut self, id: u64, payload: String) -> Result<RpcResponse, TransportError> {
        self.socket.send(Message::Text(payload.into())).await?;

        loop {
            let text = self.next_text().await?;
            let frame: Value = serde_json::from_str(text.as_str())
                .map_err(|error| TransportError::Malformed(error.to_string()))?;

            // Only the matching frame has to be a well-formed response.
            match frame.get("id").and_then(parse_request_id) {
                Some(received) if received == id => {
                    return serde_json::from_value(frame)
                        .map_err(|error| TransportError::Malformed(error.to_string()));
                }
                Some(received) => {
                    warn!(
                        expected = id,
                        received, "skipping upstream response with unexpected id"
                    );
                }
                None => debug!(expected = id, "skipping unsolicited upstream message"),
            }
        }
    }

    /// Reads the next text frame, skipping control and binary frames.
    pub(crate) async fn next_text(&mut self) -> Result<Utf8Bytes, TransportError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(payload))) => {
                    debug!(size = payload.len(), "ignoring binary upstream frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Err(TransportError::Closed),
                Some(Err(error)) => return Err(error.into()),
            }
        }
    }

    pub(crate) async fn close(mut self) {
        if let Err(error) = self.socket.close(None).await {
            debug!(%error, "upstream close handshake failed");
        }
    }
}

fn parse_request_id(value: &Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }

    if let Some(number) = value.as_i64() {
        if number >= 0 {
            return Some(number as u64);
        }
    }

    value.as_str().and_then(|raw| raw.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{error, result, FakeUpstream, Reply};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn ids_increase_per_call() {
        let upstream =
            FakeUpstream::spawn(|req| vec![result(req, json!({ "echo": req["method"] }))]).await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let first = rpc.call("first", json!({})).await.unwrap();
        let second = rpc.call("second", json!({ "x": 1 })).await.unwrap();

        assert_eq!(first.result()["echo"], "first");
        assert_eq!(second.result()["echo"], "second");
        let requests = upstream.requests();
        assert_eq!(requests[0]["id"], 1);
        assert_eq!(requests[1]["id"], 2);
        assert_eq!(requests[1]["jsonrpc"], "2.0");
        assert_eq!(requests[1]["params"]["x"], 1);
    }

    #[tokio::test]
    async fn interleaved_messages_are_skipped() {
        let upstream = FakeUpstream::spawn(|req| {
            vec![
                Reply::Text(json!({ "sid": "s", "pow": [1.0], "time": 1.5 }).to_string()),
                Reply::Text(json!({ "id": 99, "result": { "stale": true } }).to_string()),
                result(req, json!({ "fresh": true })),
            ]
        })
        .await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let response = rpc.call("queryHeadsets", json!({})).await.unwrap();
        assert_eq!(response.result()["fresh"], true);
    }

    #[tokio::test]
    async fn unrelated_events_of_any_shape_are_skipped() {
        let upstream = FakeUpstream::spawn(|req| {
            vec![
                Reply::Text(json!({ "sid": "s", "error": "headset disconnected" }).to_string()),
                Reply::Text(json!({ "id": 99, "error": "stale" }).to_string()),
                Reply::Text("[1,2,3]".to_string()),
                Reply::Text("\"warning\"".to_string()),
                result(req, json!({ "fresh": true })),
            ]
        })
        .await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let response = rpc.call("controlDevice", json!({})).await.unwrap();
        assert_eq!(response.result()["fresh"], true);
    }

    #[tokio::test]
    async fn matching_frame_with_bad_error_shape_is_malformed() {
        let upstream = FakeUpstream::spawn(|req| {
            vec![Reply::Text(json!({ "id": req["id"], "error": "nope" }).to_string())]
        })
        .await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let outcome = rpc.call("authorize", json!({})).await;
        assert!(matches!(
            outcome,
            Err(BridgeError::Transport(TransportError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn string_ids_are_correlated() {
        let upstream = FakeUpstream::spawn(|req| {
            let id = req["id"].to_string();
            vec![Reply::Text(json!({ "id": id, "result": 7 }).to_string())]
        })
        .await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let response = rpc.call("any", json!({})).await.unwrap();
        assert_eq!(response.result(), &json!(7));
    }

    #[tokio::test]
    async fn error_object_becomes_rpc_error() {
        let upstream = FakeUpstream::spawn(|req| vec![error(req, -32002, "Invalid token")]).await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        match rpc.call("authorize", json!({})).await {
            Err(BridgeError::Rpc { code, message }) => {
                assert_eq!(code, -32002);
                assert_eq!(message, "Invalid token");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let upstream = FakeUpstream::spawn(|_| Vec::new()).await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, Duration::from_millis(200))
            .await
            .unwrap();

        match rpc.call("queryHeadsets", json!({})).await {
            Err(BridgeError::Transport(TransportError::TimedOut { operation })) => {
                assert!(operation.contains("queryHeadsets"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_upstream_is_a_transport_error() {
        let upstream = FakeUpstream::spawn(|_| vec![Reply::Close]).await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let outcome = rpc.call("requestAccess", json!({})).await;
        assert!(matches!(
            outcome,
            Err(BridgeError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn malformed_frame_is_a_transport_error() {
        let upstream = FakeUpstream::spawn(|_| vec![Reply::Text("{not json".to_string())]).await;
        let mut rpc = UpstreamRpc::connect(&upstream.url, TIMEOUT).await.unwrap();

        let outcome = rpc.call("requestAccess", json!({})).await;
        assert!(matches!(
            outcome,
            Err(BridgeError::Transport(TransportError::Malformed(_)))
        ));
    }

    #[test]
    fn request_ids_parse_from_numbers_and_strings() {
        assert_eq!(parse_request_id(&json!(3)), Some(3));
        assert_eq!(parse_request_id(&json!("12")), Some(12));
        assert_eq!(parse_request_id(&json!(-1)), None);
        assert_eq!(parse_request_id(&Value::Null), None);
    }
}
