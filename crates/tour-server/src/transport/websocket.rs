//! WebSocket listener using tokio-tungstenite.
//!
//! Upgrades are accepted only on the configured path. Each accepted socket is
//! handed to the server as a [`WebSocketConnection`]; the server splits it
//! into a reader loop and a writer task.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tour_core::{encode, ServerMessage, TourError, TourResult};
use tracing::{debug, error, info, trace, warn};

use crate::connections::ConnectionId;

pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
pub type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Largest text frame dispatched (1 MiB). Larger ones are logged and dropped.
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Hard cap enforced by tungstenite while reading. A message over this ends
/// the connection before it is buffered in full.
const MAX_WS_MESSAGE_SIZE: usize = 16 * MAX_WS_FRAME_SIZE;

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_WS_MESSAGE_SIZE);
    config
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind and start accepting upgrades on `ws_path`.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    ws_path: String,
) -> TourResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TourError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %ws_path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let ws_path = ws_path.clone();
                    tokio::spawn(async move {
                        let callback =
                            |req: &Request, resp: Response| check_path(&ws_path, req, resp);
                        let accepted = tokio_tungstenite::accept_hdr_async_with_config(
                            stream,
                            callback,
                            Some(ws_config()),
                        )
                        .await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Handshake callback: only `ws_path` may upgrade.
fn check_path(ws_path: &str, req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == ws_path {
        return Ok(resp);
    }
    debug!(path = %req.uri().path(), "upgrade on unknown path rejected");
    let mut reject = ErrorResponse::new(Some("not found".to_string()));
    *reject.status_mut() = StatusCode::NOT_FOUND;
    Err(reject)
}

/// Receive the next text frame.
///
/// Returns `None` when the peer closes. Binary frames and oversized text
/// frames are dropped and the connection stays open.
pub async fn recv_text(source: &mut WsSource) -> TourResult<Option<String>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    warn!(bytes = text.len(), max = MAX_WS_FRAME_SIZE, "oversized frame dropped");
                    continue;
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Binary(data))) => {
                trace!(bytes = data.len(), "binary frame ignored");
            }
            // Pongs are queued by tungstenite and flushed with the next write.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TourError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

/// Send one envelope as a text frame.
pub async fn send_envelope(sink: &mut WsSink, msg: &ServerMessage) -> TourResult<()> {
    let text = encode(msg)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| TourError::Transport(format!("WS send failed: {e}")))
}

/// Writer task: drain `outbound` into the socket until every sender is gone
/// or the socket fails, then close the socket.
pub async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<ServerMessage>,
    conn_id: ConnectionId,
    log_frames: bool,
) {
    while let Some(msg) = outbound.recv().await {
        if log_frames {
            debug!(conn_id, ?msg, "ws send");
        }
        if let Err(e) = send_envelope(&mut sink, &msg).await {
            debug!(conn_id, error = %e, "writer stopped");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
