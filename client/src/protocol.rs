use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use ringwire::collab::{DraftId, Event, UserId};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_USER_HEADER: &str = "x-user-id";
const PING_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("connection closed before the connected ack")]
    ClosedBeforeAck,
    #[error("rejected by server: {code} ({message})")]
    Rejected { code: String, message: String },
}

/// How the client identifies itself on both channels.
#[derive(Clone)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub user: Option<String>,
    pub user_header: HeaderName,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            bearer: None,
            user: None,
            user_header: HeaderName::from_static(DEFAULT_USER_HEADER),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("user_header", &self.user_header)
            .finish()
    }
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            ..Self::default()
        }
    }

    /// Plain identity header. Only honoured by servers that opt in.
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), InvalidHeaderValue> {
        if let Some(token) = &self.bearer {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        if let Some(user) = &self.user {
            headers.insert(self.user_header.clone(), HeaderValue::from_str(user)?);
        }
        Ok(())
    }
}

/// The `connected` ack sent once the gatekeeper admits us.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Connected {
    pub draft_id: DraftId,
    pub connection_id: String,
    pub user_id: UserId,
    pub ts: String,
    #[serde(default)]
    pub keepalive_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Connected(Connected),
    Pong,
    Error { code: String, message: String },
    Event(Event),
    Unknown(String),
}

#[derive(Deserialize)]
struct ErrorFrame {
    code: String,
    #[serde(default)]
    message: String,
}

/// Parse one server frame. Non-text frames and non-JSON text yield `None`.
pub fn parse_server_message(msg: &Message) -> Option<ServerMessage> {
    let Message::Text(text) = msg else {
        return None;
    };
    let value: serde_json::Value = serde_json::from_str(text.as_str()).ok()?;
    let kind = value.get("type")?.as_str()?.to_owned();
    match kind.as_str() {
        "connected" => serde_json::from_value(value).ok().map(ServerMessage::Connected),
        "pong" => Some(ServerMessage::Pong),
        "error" => serde_json::from_value::<ErrorFrame>(value)
            .ok()
            .map(|e| ServerMessage::Error {
                code: e.code,
                message: e.message,
            }),
        _ => match serde_json::from_value::<Event>(value) {
            Ok(event) => Some(ServerMessage::Event(event)),
            Err(_) => Some(ServerMessage::Unknown(kind)),
        },
    }
}

/// Open a push channel and wait for the `connected` ack. An error frame
/// before the ack becomes [`ConnectError::Rejected`].
pub async fn connect(
    url: &str,
    credentials: &Credentials,
    wait: Duration,
) -> Result<(WsStream, Connected), ConnectError> {
    let mut request = url.into_client_request()?;
    credentials.apply(request.headers_mut())?;

    let (mut ws, _response) = timeout(wait, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| ConnectError::Timeout)??;

    let deadline = Instant::now() + wait;
    loop {
        let msg = timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ConnectError::Timeout)?
            .ok_or(ConnectError::ClosedBeforeAck)??;

        match parse_server_message(&msg) {
            Some(ServerMessage::Connected(connected)) => return Ok((ws, connected)),
            Some(ServerMessage::Error { code, message }) => {
                return Err(ConnectError::Rejected { code, message });
            }
            _ if matches!(msg, Message::Close(_)) => return Err(ConnectError::ClosedBeforeAck),
            _ => {}
        }
    }
}

/// Forward draft events from `ws` into `events` until either side goes
/// away. Sends a JSON ping every `keepalive` so idle channels stay admitted.
pub async fn pump_events(ws: WsStream, keepalive: Duration, events: mpsc::Sender<Event>) {
    let keepalive = keepalive.max(Duration::from_secs(1));
    let (mut sink, mut stream) = ws.split();
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if sink.send(Message::text(PING_FRAME)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(msg)) => match parse_server_message(&msg) {
                    Some(ServerMessage::Event(event)) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(ServerMessage::Error { code, message }) => {
                        warn!(%code, %message, "push channel error");
                    }
                    _ => {
                        if let Message::Close(frame) = msg {
                            debug!(?frame, "push channel closed by server");
                            break;
                        }
                    }
                },
                Some(Err(e)) => {
                    debug!(error = %e, "push channel read error");
                    break;
                }
                None => break,
            },
            _ = events.closed() => break,
        }
    }
    let _ = sink.close().await;
}
