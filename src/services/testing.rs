//! Scripted upstream service used by the session tests.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub(crate) enum Reply {
    Text(String),
    Close,
}

pub(crate) struct FakeUpstream {
    pub(crate) url: String,
    methods: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeUpstream {
    /// Accepts a single connection and answers every request with `responder`.
    pub(crate) async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<Reply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let methods = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded_methods = methods.clone();
        let recorded_requests = requests.clone();
        let task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut socket) = accept_async(stream).await else {
                return;
            };

            while let Some(Ok(message)) = socket.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                recorded_methods.lock().unwrap().push(method);
                recorded_requests.lock().unwrap().push(request.clone());

                for reply in responder(&request) {
                    let sent = match reply {
                        Reply::Text(frame) => socket.send(Message::Text(frame.into())).await,
                        Reply::Close => {
                            let _ = socket.close(None).await;
                            return;
                        }
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            url,
            methods,
            requests,
            task,
        }
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn result(request: &Value, result: Value) -> Reply {
    Reply::Text(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }).to_string())
}

pub(crate) fn error(request: &Value, code: i64, message: &str) -> Reply {
    Reply::Text(
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": code, "message": message }
        })
        .to_string(),
    )
}

pub(crate) const TOKEN: &str = "token-0123456789abcdef";
pub(crate) const HEADSET: &str = "INSIGHT-A1B2C3D4";
pub(crate) const SESSION: &str = "session-42";

/// Successful answers for every call the bridge makes.
pub(crate) fn happy_path(request: &Value) -> Vec<Reply> {
    let reply = match request["method"].as_str().unwrap_or_default() {
        "requestAccess" => result(request, json!({ "accessGranted": true, "message": "ok" })),
        "authorize" => result(request, json!({ "cortexToken": TOKEN })),
        "queryHeadsets" => result(
            request,
            json!([{ "id": HEADSET, "status": "discovered" }, { "id": "EPOC-OTHER" }]),
        ),
        "controlDevice" => result(request, json!({ "command": "connect", "status": "connected" })),
        "createSession" => result(request, json!({ "id": SESSION, "status": "activated" })),
        "subscribe" => result(request, json!({ "success": [], "failure": [] })),
        "updateSession" => result(request, json!({ "id": SESSION, "status": "closed" })),
        _ => error(request, -32601, "Method not found"),
    };
    vec![reply]
}
