// =============================================================================
// Push gateway: tokio + tungstenite.
//
// Per connection:
//   - handshake captures path + headers, then the gatekeeper admits or rejects
//   - `connected` ack is queued before the hub sees the connection
//   - writer task: feed() + batched try_recv() + single flush(), each bounded
//     by the send timeout
//   - read loop: JSON ping/pong, payload ceiling, keepalive deadline
//   - the hub registration is released exactly once, by a drop guard
// =============================================================================

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::gatekeeper::{ConnectionPermit, Gatekeeper};
use super::hub::{ConnectionHandle, Hub};

const ROOM_PATH_PREFIX: &str = "/ws/drafts/";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_COALESCE: u32 = 64;

pub const CLOSE_INVALID_ROOM: u16 = 4400;
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 4408;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    pub bind: String,
    pub max_payload_bytes: usize,
    /// Empty allows every origin.
    pub allowed_origins: Vec<String>,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub send_timeout_ms: u64,
    pub outbound_buffer: usize,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7070".into(),
            max_payload_bytes: 64 * 1024,
            allowed_origins: Vec::new(),
            keepalive_interval_secs: 25,
            keepalive_timeout_secs: 60,
            send_timeout_ms: 5000,
            outbound_buffer: 256,
        }
    }
}

/// Runtime knobs of the gateway.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub max_payload_bytes: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub send_timeout: Duration,
    pub outbound_buffer: usize,
}

impl From<&PushSettings> for GatewayConfig {
    fn from(s: &PushSettings) -> Self {
        Self {
            max_payload_bytes: s.max_payload_bytes,
            keepalive_interval: Duration::from_secs(s.keepalive_interval_secs.max(1)),
            keepalive_timeout: Duration::from_secs(s.keepalive_timeout_secs.max(1)),
            send_timeout: Duration::from_millis(s.send_timeout_ms.max(1)),
            outbound_buffer: s.outbound_buffer.max(1),
        }
    }
}

impl GatewayConfig {
    /// Frame and message ceilings for the codec, so an oversized frame is
    /// refused from its header instead of being buffered first.
    fn websocket_config(&self) -> WebSocketConfig {
        let ceiling = self.max_payload_bytes.max(1);
        WebSocketConfig::default()
            .max_message_size(Some(ceiling))
            .max_frame_size(Some(ceiling))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&PushSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn build_error_json(code: &str, message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

fn build_connected(room: &str, conn_id: &str, user_id: &str, keepalive: Duration) -> String {
    serde_json::json!({
        "type": "connected",
        "draft_id": room,
        "connection_id": conn_id,
        "user_id": user_id,
        "ts": now_iso(),
        "keepalive_secs": keepalive.as_secs(),
    })
    .to_string()
}

fn build_pong() -> String {
    serde_json::json!({"type": "pong", "ts": now_iso()}).to_string()
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }))
}

/// Draft id from `/ws/drafts/{id}`.
pub fn room_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix(ROOM_PATH_PREFIX)?.trim_end_matches('/');
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Why a read loop ended.
enum Exit {
    ClientClosed,
    Transport,
    Cancelled,
    Rejected {
        code: &'static str,
        message: String,
        close_code: u16,
    },
}

impl Exit {
    fn reason(&self) -> &'static str {
        match self {
            Exit::ClientClosed => "client_closed",
            Exit::Transport => "transport_error",
            Exit::Cancelled => "cancelled",
            Exit::Rejected { code, .. } => *code,
        }
    }
}

/// Hub membership plus gatekeeper capacity for one connection. Dropping it
/// unregisters, then releases the permit.
struct Registration {
    hub: Arc<Hub>,
    room: String,
    conn_id: String,
    _permit: ConnectionPermit,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.room, &self.conn_id);
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub struct PushGateway {
    config: GatewayConfig,
    hub: Arc<Hub>,
    gatekeeper: Arc<Gatekeeper>,
}

impl PushGateway {
    pub fn new(config: GatewayConfig, hub: Arc<Hub>, gatekeeper: Arc<Gatekeeper>) -> Self {
        Self {
            config,
            hub,
            gatekeeper,
        }
    }

    /// Accept until `shutdown` fires. Cancelling `shutdown` also closes every
    /// admitted connection with 1001.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "push gateway listening");
        }
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let gateway = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            gateway.handle_connection(stream, addr, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
                _ = shutdown.cancelled() => break,
            }
        }
        info!("push gateway stopped accepting");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        // OnceLock captures path + headers in the handshake callback
        struct Handshake {
            path: String,
            headers: HeaderMap,
        }
        let captured: Arc<OnceLock<Handshake>> = Arc::new(OnceLock::new());
        let captured_cb = Arc::clone(&captured);

        let accept = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let _ = captured_cb.set(Handshake {
                    path: req.uri().path().to_owned(),
                    headers: req.headers().clone(),
                });
                Ok(response)
            },
            Some(self.config.websocket_config()),
        );
        let ws = match timeout(HANDSHAKE_TIMEOUT, accept).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "ws handshake failed");
                return;
            }
            Err(_) => {
                debug!(%addr, "ws handshake timed out");
                return;
            }
        };
        let Some(Handshake { path, headers }) = captured.get() else {
            return;
        };
        let (mut sink, mut stream) = ws.split();

        let Some(room) = room_from_path(path).map(str::to_owned) else {
            warn!(%addr, path = %path, "connection rejected: not a draft channel");
            self.reject(&mut sink, "invalid_room", "expected /ws/drafts/{draft_id}", CLOSE_INVALID_ROOM)
                .await;
            return;
        };
        let admission = match self.gatekeeper.admit(headers, &room) {
            Ok(admission) => admission,
            Err(rejection) => {
                self.reject(
                    &mut sink,
                    rejection.code(),
                    &rejection.to_string(),
                    rejection.close_code(),
                )
                .await;
                return;
            }
        };
        let user_id = admission.user_id;
        let conn_id = Uuid::now_v7().to_string();

        let (tx, rx) = mpsc::channel::<Message>(self.config.outbound_buffer);
        let close = shutdown.child_token();

        // Ack goes first so it precedes any broadcast.
        let _ = tx.try_send(Message::text(build_connected(
            &room,
            &conn_id,
            user_id.as_str(),
            self.config.keepalive_interval,
        )));
        self.hub.register(
            &room,
            ConnectionHandle::new(conn_id.clone(), user_id.clone(), tx.clone(), close.clone()),
        );
        let registration = Registration {
            hub: Arc::clone(&self.hub),
            room: room.clone(),
            conn_id: conn_id.clone(),
            _permit: admission.permit,
        };
        info!(conn_id = %conn_id, draft_id = %room, user_id = %user_id, %addr, "connection registered");

        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            close.clone(),
            shutdown,
            self.config.send_timeout,
        ));

        let exit = self.read_loop(&mut stream, &tx, &close, &conn_id).await;
        if let Exit::Rejected {
            code,
            message,
            close_code,
        } = &exit
        {
            let _ = tx.try_send(Message::text(build_error_json(code, message)));
            let _ = tx.try_send(close_frame(*close_code, code));
        }

        drop(registration);
        drop(tx);
        let _ = writer.await;
        info!(conn_id = %conn_id, draft_id = %room, reason = exit.reason(), "connection closed");
    }

    async fn read_loop<S>(
        &self,
        stream: &mut S,
        tx: &mpsc::Sender<Message>,
        close: &CancellationToken,
        conn_id: &str,
    ) -> Exit
    where
        S: futures_util::Stream<Item = Result<Message, WsError>>
            + Unpin,
    {
        let interval = self.config.keepalive_interval;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_seen = Instant::now();

        loop {
            let deadline = last_seen + self.config.keepalive_timeout;
            tokio::select! {
                _ = close.cancelled() => return Exit::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    return Exit::Rejected {
                        code: "keepalive_timeout",
                        message: "no traffic within the keepalive timeout".into(),
                        close_code: CLOSE_KEEPALIVE_TIMEOUT,
                    };
                }
                _ = ping_timer.tick() => {
                    let _ = tx.try_send(Message::Ping(Bytes::new()));
                }
                frame = stream.next() => match frame {
                    None => return Exit::Transport,
                    Some(Err(WsError::Capacity(e))) => {
                        debug!(conn_id, error = %e, "inbound frame over the ceiling");
                        let len = match e {
                            CapacityError::MessageTooLong { size, .. } => size,
                            _ => self.config.max_payload_bytes.saturating_add(1),
                        };
                        return self.too_large(len);
                    }
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "read error");
                        return Exit::Transport;
                    }
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        if let Some(exit) = self.on_frame(msg, tx, conn_id) {
                            return exit;
                        }
                    }
                },
            }
        }
    }

    fn on_frame(&self, msg: Message, tx: &mpsc::Sender<Message>, conn_id: &str) -> Option<Exit> {
        match msg {
            Message::Text(text) => {
                if text.len() > self.config.max_payload_bytes {
                    return Some(self.too_large(text.len()));
                }
                match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                    Ok(val) if val.get("type").and_then(|t| t.as_str()) == Some("ping") => {
                        let _ = tx.try_send(Message::text(build_pong()));
                    }
                    Ok(_) | Err(_) => {
                        // Mutations go through the HTTP API only.
                        trace!(conn_id, "ignoring inbound payload");
                    }
                }
            }
            Message::Binary(data) => {
                if data.len() > self.config.max_payload_bytes {
                    return Some(self.too_large(data.len()));
                }
                trace!(conn_id, "ignoring inbound binary payload");
            }
            Message::Ping(payload) => {
                let _ = tx.try_send(Message::Pong(payload));
            }
            Message::Close(_) => return Some(Exit::ClientClosed),
            Message::Pong(_) | Message::Frame(_) => {}
        }
        None
    }

    fn too_large(&self, len: usize) -> Exit {
        Exit::Rejected {
            code: "payload_too_large",
            message: format!(
                "payload of {len} bytes exceeds the {} byte limit",
                self.config.max_payload_bytes
            ),
            close_code: u16::from(CloseCode::Size),
        }
    }

    /// Error frame + close frame for a connection that never got admitted.
    async fn reject(&self, sink: &mut WsSink, code: &str, message: &str, close_code: u16) {
        let send = async {
            sink.feed(Message::text(build_error_json(code, message))).await?;
            sink.feed(close_frame(close_code, code)).await?;
            sink.flush().await
        };
        if let Ok(Err(e)) = timeout(self.config.send_timeout, send).await {
            debug!(code, error = %e, "failed to deliver rejection");
        }
        let _ = timeout(self.config.send_timeout, sink.close()).await;
    }
}

/// Drain the outbound queue into the socket. Every socket write is bounded by
/// `send_timeout`; missing it cancels `close`, which ends the read loop.
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Message>,
    close: CancellationToken,
    shutdown: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = close.cancelled() => {
                let frame = if shutdown.is_cancelled() {
                    close_frame(u16::from(CloseCode::Away), "server shutting down")
                } else {
                    close_frame(u16::from(CloseCode::Policy), "connection pruned")
                };
                let _ = timeout(send_timeout, sink.send(frame)).await;
                return;
            }
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        // Coalescing: feed what is already queued, then flush once
        let mut ok = matches!(timeout(send_timeout, sink.feed(first)).await, Ok(Ok(())));
        let mut count = 1u32;
        while ok && count < MAX_COALESCE {
            match rx.try_recv() {
                Ok(msg) => {
                    ok = matches!(timeout(send_timeout, sink.feed(msg)).await, Ok(Ok(())));
                    count += 1;
                }
                Err(_) => break,
            }
        }
        if ok {
            ok = matches!(timeout(send_timeout, sink.flush()).await, Ok(Ok(())));
        }
        if !ok {
            debug!("send failed or timed out, closing connection");
            close.cancel();
            return;
        }
    }
    let _ = timeout(send_timeout, sink.close()).await;
}
