use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use gateway_relay::gateway::protocol::{parse_frame, Frame};

/// A scratch directory under `std::env::temp_dir()`, removed on drop.
pub struct TempStateDir {
    path: std::path::PathBuf,
}

impl TempStateDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!("gateway-relay-test-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("temp state dir should be creatable");
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempStateDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// In-process stand-in for the agent gateway: accepts one WebSocket connection,
/// completes the `connect` handshake and answers `sessions.usage` automatically
/// (an uninteresting precondition for every chat task), then forwards every other
/// `Req` frame to the test for scripted replies.
pub struct FakeGateway {
    pub url: String,
    requests: mpsc::Receiver<(String, String, Value)>,
    outgoing: mpsc::Sender<Frame>,
}

impl FakeGateway {
    pub async fn start(tick_interval_ms: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake gateway listener");
        let addr = listener.local_addr().expect("local addr");
        let url = format!("ws://{addr}");

        let (req_tx, req_rx) = mpsc::channel(32);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(32);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept fake gateway connection");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("server websocket handshake");

            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(Frame::Req { id, method, .. }) if method == "connect" => {
                            let hello = json!({
                                "protocol": 2,
                                "policy": { "tickIntervalMs": tick_interval_ms },
                                "features": { "methods": ["chat.send", "chat.abort", "sessions.usage"], "events": ["chat", "tick"] },
                                "auth": { "role": "agent", "scopes": ["operator.admin"] },
                            });
                            let res = Frame::Res { id, ok: true, payload: Some(hello), error: None };
                            let text = serde_json::to_string(&res).expect("HelloOk frame serializes");
                            if ws.send(Message::Text(text.into())).await.is_err() {
                                return;
                            }
                            break;
                        }
                        _ => continue,
                    },
                    _ => return,
                }
            }

            let half_interval = Duration::from_millis(tick_interval_ms.max(2) / 2);
            let mut ticker = tokio::time::interval(half_interval);
            loop {
                tokio::select! {
                    incoming = ws.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(frame) = parse_frame(&text) else { continue };
                                match frame {
                                    Frame::Req { id, method, params: _ } if method == "sessions.usage" => {
                                        let res = Frame::Res { id, ok: true, payload: Some(json!({})), error: None };
                                        let text = serde_json::to_string(&res).expect("usage snapshot frame serializes");
                                        if ws.send(Message::Text(text.into())).await.is_err() {
                                            return;
                                        }
                                    }
                                    Frame::Req { id, method, params } => {
                                        if req_tx.send((id, method, params)).await.is_err() {
                                            return;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            _ => return,
                        }
                    }
                    _ = ticker.tick() => {
                        let tick = Frame::Event { event: "tick".to_string(), payload: Value::Null, seq: None };
                        let text = serde_json::to_string(&tick).expect("tick frame serializes");
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(frame) => {
                                let text = serde_json::to_string(&frame).expect("outgoing frame serializes");
                                if ws.send(Message::Text(text.into())).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        Self { url, requests: req_rx, outgoing: out_tx }
    }

    /// Waits for the next non-`sessions.usage` request the client sends, returning
    /// `(requestId, method, params)`.
    pub async fn next_request(&mut self) -> (String, String, Value) {
        self.requests.recv().await.expect("fake gateway channel closed before a request arrived")
    }

    pub async fn reply_ok(&self, id: &str, payload: Value) {
        self.outgoing
            .send(Frame::Res { id: id.to_string(), ok: true, payload: Some(payload), error: None })
            .await
            .expect("fake gateway outgoing channel closed");
    }

    pub async fn emit_chat(&self, payload: Value) {
        self.outgoing
            .send(Frame::Event { event: "chat".to_string(), payload, seq: None })
            .await
            .expect("fake gateway outgoing channel closed");
    }
}

/// In-process stand-in for the backend: captures every posted callback body.
pub struct FakeBackend {
    pub base_url: String,
    callbacks: mpsc::Receiver<Value>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let (tx, rx) = mpsc::channel::<Value>(32);

        async fn handler(State(tx): State<mpsc::Sender<Value>>, Json(body): Json<Value>) -> axum::http::StatusCode {
            let _ = tx.send(body).await;
            axum::http::StatusCode::OK
        }

        let app = Router::new().route("/api/v1/relays/messages", post(handler)).with_state(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake backend listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url: format!("http://{addr}"), callbacks: rx }
    }

    pub async fn next_callback(&mut self) -> Value {
        self.callbacks.recv().await.expect("fake backend channel closed before a callback arrived")
    }
}
