//! WebSocket side of the reconnecting transport.
//!
//! A supervisor task owns the socket. Callers hold a cheap, cloneable
//! [`ReconnectingTransport`] handle; envelopes go through a bounded channel
//! and events come back on another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use tour_core::{codec, now_millis, ClientMessage, ServerMessage, TourError, TourResult};

use super::{backoff_delay, TransportConfig, TransportEvent, NORMAL_CLOSE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Envelopes buffered between the caller and the socket.
const OUTBOUND_CAPACITY: usize = 256;
/// Events buffered between the socket and the caller.
const EVENT_CAPACITY: usize = 256;

/// Handle to a self-reconnecting connection.
#[derive(Clone)]
pub struct ReconnectingTransport {
    outbound: mpsc::Sender<ClientMessage>,
    open: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    config: Arc<TransportConfig>,
}

impl ReconnectingTransport {
    /// Start connecting in the background. Must be called inside a tokio
    /// runtime. Events stop once the returned receiver is dropped.
    pub fn connect(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);

        tokio::spawn(supervise(
            config.clone(),
            outbound_rx,
            events_tx,
            open.clone(),
            shutdown_rx,
        ));

        let handle = Self {
            outbound: outbound_tx,
            open,
            shutdown: Arc::new(shutdown_tx),
            config,
        };
        (handle, events_rx)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Queue an envelope. Dropped (returns `false`) when the socket is not
    /// open; nothing is held back for a later connection.
    pub fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_open() {
            debug!("transport not open, envelope dropped");
            return false;
        }
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "outbound queue unavailable, envelope dropped");
                false
            }
        }
    }

    /// Wait for the socket to open, polling a bounded number of times.
    pub async fn wait_open(&self) -> TourResult<()> {
        for _ in 0..self.config.open_poll_attempts {
            if self.is_open() {
                return Ok(());
            }
            tokio::time::sleep(self.config.open_poll_interval).await;
        }
        if self.is_open() {
            Ok(())
        } else {
            Err(TourError::Timeout)
        }
    }

    /// Flush queued envelopes, close cleanly, and stop reconnecting.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Why one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// The server sent a close frame.
    Closed(Option<u16>),
    /// The socket failed or never opened.
    Dropped,
    /// We closed it, or nobody is listening any more.
    Shutdown,
}

async fn supervise(
    config: Arc<TransportConfig>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            res = connect_async(config.url.as_str()) => res,
            _ = shutdown.changed() => break,
        };

        let end = match connected {
            Ok((ws, _response)) => {
                info!(url = %config.url, "connected");
                failures = 0;
                // Envelopes queued for the previous socket are stale.
                while outbound.try_recv().is_ok() {}
                open.store(true, Ordering::Release);
                let end = if events.send(TransportEvent::Connected).await.is_err() {
                    ConnectionEnd::Shutdown
                } else {
                    run_connection(ws, &config, &mut outbound, &events, &mut shutdown).await
                };
                open.store(false, Ordering::Release);
                if let ConnectionEnd::Closed(code) = end {
                    events.send(TransportEvent::Disconnected { code }).await.ok();
                } else if end == ConnectionEnd::Dropped {
                    events
                        .send(TransportEvent::Disconnected { code: None })
                        .await
                        .ok();
                }
                end
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "connect failed");
                ConnectionEnd::Dropped
            }
        };

        match end {
            ConnectionEnd::Shutdown => break,
            ConnectionEnd::Closed(Some(NORMAL_CLOSE)) => {
                info!("server closed the connection");
                break;
            }
            _ => {}
        }

        failures += 1;
        if failures > config.max_attempts {
            warn!(attempts = config.max_attempts, "giving up reconnecting");
            events.send(TransportEvent::GaveUp).await.ok();
            break;
        }

        let delay = backoff_delay(config.base_delay, failures);
        info!(
            attempt = failures,
            max = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    open.store(false, Ordering::Release);
    debug!("transport stopped");
}

async fn run_connection(
    ws: WsStream,
    config: &TransportConfig,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut sink, mut source): (WsSink, WsSource) = ws.split();
    let period = config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match codec::decode::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if events.send(TransportEvent::Message(msg)).await.is_err() {
                            close(&mut sink).await;
                            return ConnectionEnd::Shutdown;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed server envelope"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    debug!(?code, "close frame received");
                    return ConnectionEnd::Closed(code);
                }
                Some(Ok(other)) => trace!(kind = ?other, "ignoring non-text frame"),
                Some(Err(e)) => {
                    warn!(error = %e, "connection lost");
                    return ConnectionEnd::Dropped;
                }
                None => return ConnectionEnd::Dropped,
            },
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = send_envelope(&mut sink, &msg).await {
                        warn!(error = %e, "send failed");
                        return ConnectionEnd::Dropped;
                    }
                }
                None => {
                    close(&mut sink).await;
                    return ConnectionEnd::Shutdown;
                }
            },
            _ = heartbeat.tick() => {
                let beat = ClientMessage::Heartbeat { timestamp: Some(now_millis()) };
                if let Err(e) = send_envelope(&mut sink, &beat).await {
                    warn!(error = %e, "heartbeat failed");
                    return ConnectionEnd::Dropped;
                }
            },
            _ = shutdown.changed() => {
                while let Ok(msg) = outbound.try_recv() {
                    if send_envelope(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                close(&mut sink).await;
                return ConnectionEnd::Shutdown;
            },
        }
    }
}

async fn send_envelope(sink: &mut WsSink, msg: &ClientMessage) -> TourResult<()> {
    let text = codec::encode(msg)?;
    trace!(len = text.len(), "sending envelope");
    sink.send(Message::Text(text))
        .await
        .map_err(|e| TourError::Transport(format!("WS write error: {e}")))
}

async fn close(sink: &mut WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        trace!(error = %e, "close frame not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tour_core::{TerminalEvent, TerminalRequest};

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        (listener, url)
    }

    fn fast(url: &str) -> TransportConfig {
        TransportConfig {
            base_delay: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(3600),
            open_poll_interval: Duration::from_millis(10),
            ..TransportConfig::new(url)
        }
    }

    async fn accept(listener: &TcpListener) -> WsStream {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> Option<TransportEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("transport event")
    }

    async fn next_client_message(ws: &mut WsStream) -> ClientMessage {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return codec::decode(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn delivers_both_ways() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let msg = next_client_message(&mut ws).await;
            assert_eq!(
                msg,
                ClientMessage::Terminal(TerminalRequest::Check {
                    session_id: "t1".into()
                })
            );
            let reply = ServerMessage::from(TerminalEvent::Exists {
                session_id: "t1".into(),
            });
            ws.send(Message::Text(codec::encode(&reply).unwrap()))
                .await
                .unwrap();
            ws.next().await;
        });

        let (transport, mut events) = ReconnectingTransport::connect(fast(&url));
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
        transport.wait_open().await.unwrap();
        assert!(transport.send(ClientMessage::Terminal(TerminalRequest::Check {
            session_id: "t1".into()
        })));
        assert_eq!(
            next_event(&mut events).await,
            Some(TransportEvent::Message(ServerMessage::from(
                TerminalEvent::Exists {
                    session_id: "t1".into()
                }
            )))
        );
        transport.close();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_is_final() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            };
            ws.send(Message::Close(Some(frame))).await.ok();
            ws.next().await;
            // Keep listening so a wrongful reconnect would succeed.
            let _second = accept(&listener).await;
        });

        let (transport, mut events) = ReconnectingTransport::connect(fast(&url));
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
        assert_eq!(
            next_event(&mut events).await,
            Some(TransportEvent::Disconnected {
                code: Some(NORMAL_CLOSE)
            })
        );
        assert_eq!(next_event(&mut events).await, None);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn dropped_connection_reconnects() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let first = accept(&listener).await;
            drop(first);
            let mut second = accept(&listener).await;
            next_client_message(&mut second).await
        });

        let (transport, mut events) = ReconnectingTransport::connect(fast(&url));
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
        assert_eq!(
            next_event(&mut events).await,
            Some(TransportEvent::Disconnected { code: None })
        );
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));

        transport.send(ClientMessage::Heartbeat { timestamp: Some(1) });
        assert_eq!(
            server.await.unwrap(),
            ClientMessage::Heartbeat { timestamp: Some(1) }
        );
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let (listener, url) = listen().await;
        drop(listener);

        let config = TransportConfig {
            max_attempts: 2,
            ..fast(&url)
        };
        let (transport, mut events) = ReconnectingTransport::connect(config);
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::GaveUp));
        assert_eq!(next_event(&mut events).await, None);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn send_while_closed_is_dropped() {
        let (listener, url) = listen().await;
        drop(listener);

        let config = TransportConfig {
            max_attempts: 0,
            open_poll_attempts: 3,
            ..fast(&url)
        };
        let (transport, _events) = ReconnectingTransport::connect(config);
        assert!(!transport.send(ClientMessage::Heartbeat { timestamp: None }));
        assert!(matches!(transport.wait_open().await, Err(TourError::Timeout)));
    }

    #[tokio::test]
    async fn heartbeats_while_open() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_client_message(&mut ws).await
        });

        let config = TransportConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..fast(&url)
        };
        let (_transport, mut events) = ReconnectingTransport::connect(config);
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
        let beat = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            beat,
            ClientMessage::Heartbeat {
                timestamp: Some(ts)
            } if ts > 0
        ));
    }

    #[tokio::test]
    async fn close_flushes_then_sends_close_frame() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let first = next_client_message(&mut ws).await;
            let code = loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => break frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => continue,
                    _ => break None,
                }
            };
            (first, code)
        });

        let (transport, mut events) = ReconnectingTransport::connect(fast(&url));
        assert_eq!(next_event(&mut events).await, Some(TransportEvent::Connected));
        let destroy = ClientMessage::Terminal(TerminalRequest::Destroy {
            session_id: "t1".into(),
        });
        assert!(transport.send(destroy.clone()));
        transport.close();

        let (first, code) = server.await.unwrap();
        assert_eq!(first, destroy);
        assert_eq!(code, Some(NORMAL_CLOSE));
        assert_eq!(next_event(&mut events).await, None);
    }
}
