use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::Frame;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Large enough to carry a full chat transcript round-trip.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("peer closed the connection")]
    Closed,
    #[error("frame decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A thin wrapper over the raw WebSocket stream that speaks [`Frame`] instead of
/// `Message`. Binary/ping/pong frames are ignored at this layer; text frames are
/// decoded eagerly so the client actor never deals with wire bytes.
pub struct Transport {
    stream: WsStream,
}

impl Transport {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            "relay.v2".parse().expect("static header value is valid"),
        );
        let connect = tokio_tungstenite::connect_async_with_config(
            request,
            Some(
                tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default()
                    .max_message_size(Some(MAX_FRAME_SIZE))
                    .max_frame_size(Some(MAX_FRAME_SIZE)),
            ),
            false,
        );
        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok((stream, _response))) => Ok(Self { stream }),
            Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
            Err(_) => Err(TransportError::ConnectTimeout(connect_timeout)),
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Returns `Ok(None)` for a frame this layer intentionally skips (binary/ping/
    /// pong), `Err(Closed)` when the peer hangs up, and the decoded frame otherwise.
    /// A malformed text frame yields `Err(Decode)` -- the caller decides whether that
    /// is fatal; it must not be.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return super::protocol::parse_frame(&text).map(Some).map_err(Into::into);
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Send(e.to_string())),
            }
        }
    }

    pub async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .stream
            .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(code),
                reason: reason.to_owned().into(),
            })))
            .await;
    }
}
