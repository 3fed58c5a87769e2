//! Core server: accepts WebSocket connections and dispatches envelopes.
//!
//! Each connection runs a reader loop (this module) and a writer task
//! ([`websocket::write_loop`]) joined by the connection's outbound queue in
//! [`ConnectionRegistry`]. Terminal actions go to the [`SessionRegistry`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tour_core::{
    decode, generate_session_id, now_millis, ClientMessage, NotificationLevel, ServerMessage,
    TerminalEvent, TerminalRequest, TourResult, DEFAULT_COLS, DEFAULT_ROWS,
};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::connections::{ConnectionId, ConnectionRegistry};
use crate::limits::RateLimiter;
use crate::session::{NativePtyBackend, PtyBackend, RegistrySettings, SessionRegistry};
use crate::transport::websocket::{self, WebSocketConnection};
use crate::watcher;

/// Interval of the session/limiter sweep.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// The tour terminal server instance.
pub struct TourServer {
    config: ServerConfig,
    connections: Arc<ConnectionRegistry>,
    sessions: SessionRegistry,
    /// Per-session resize limiter.
    resize_limits: Arc<Mutex<RateLimiter>>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TourServer {
    /// Create a server spawning real shells.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_backend(config, Arc::new(NativePtyBackend))
    }

    pub fn with_backend(config: ServerConfig, backend: Arc<dyn PtyBackend>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let settings = RegistrySettings {
            max_sessions: config.max_sessions,
            shell: config.shell.clone(),
            term: config.term.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
        };
        let sessions = SessionRegistry::new(backend, connections.clone(), settings);
        let resize_limits = Arc::new(Mutex::new(RateLimiter::per_second(
            config.resize_per_second,
        )));

        Self {
            config,
            connections,
            sessions,
            resize_limits,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[cfg(test)]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Bind the listener and start accepting in the background.
    ///
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> TourResult<SocketAddr> {
        let (addr, ws_rx) =
            websocket::start_listener(self.config.listen_addr(), self.config.ws_path.clone())
                .await?;

        self.spawn_gc();
        tokio::spawn(self.clone().accept_loop(ws_rx));

        info!(
            addr = %addr,
            ws_path = %self.config.ws_path,
            workdir = %self.config.workdir.display(),
            on_disconnect = ?self.config.on_disconnect,
            "tour-server ready"
        );
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        let _watcher = match &self.config.watch_path {
            Some(path) => match watcher::spawn(path, self.connections.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "file watching disabled");
                    None
                }
            },
            None => None,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                Some(conn) = ws_rx.recv() => {
                    let srv = self.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(conn).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                _ = shutdown_rx.recv() => break,
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }
    }

    fn spawn_gc(self: &Arc<Self>) {
        let sessions = self.sessions.clone();
        let resize_limits = self.resize_limits.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }
                let reaped = sessions.gc().await;
                resize_limits.lock().await.gc();
                let live = sessions.list().await;
                for s in &live {
                    trace!(
                        session_id = %s.id,
                        generation = s.generation,
                        cols = s.cols,
                        rows = s.rows,
                        running = s.running,
                        bound = ?s.bound,
                        age_secs = s.age_secs,
                        "session"
                    );
                }
                debug!(
                    sessions = live.len(),
                    detached = live.iter().filter(|s| s.bound.is_none()).count(),
                    reaped = reaped.len(),
                    "session sweep"
                );
            }
        });
    }

    /// Notify every client, stop accepting and kill all shells.
    pub async fn shutdown(&self) {
        let notified = self
            .connections
            .broadcast(ServerMessage::SystemNotification {
                message: "Server is shutting down".into(),
                level: NotificationLevel::Warning,
            })
            .await;
        let _ = self.shutdown_tx.send(());
        let killed = self.sessions.destroy_all().await;
        info!(notified, killed, "server shutdown");
    }

    /// Resolve once every connection has unregistered.
    pub async fn wait_drained(&self) {
        while self.connections.count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) -> TourResult<()> {
        let remote = conn.remote_addr;
        // Subscribe first so a registered connection never misses shutdown.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (conn_id, outbound_rx) = self.connections.register().await;
        info!(conn_id, remote = %remote, "client connected");

        let (sink, mut source) = conn.ws_stream.split();
        let writer = tokio::spawn(websocket::write_loop(
            sink,
            outbound_rx,
            conn_id,
            self.config.debug_websocket,
        ));

        let result = loop {
            tokio::select! {
                frame = websocket::recv_text(&mut source) => match frame {
                    Ok(Some(text)) => self.handle_text(conn_id, &text).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.recv() => break Ok(()),
            }
        };

        self.connections.unregister(conn_id).await;
        let affected = self
            .sessions
            .detach_connection(conn_id, self.config.on_disconnect)
            .await;
        let _ = writer.await;
        info!(conn_id, remote = %remote, sessions = affected.len(), "client disconnected");
        result
    }

    async fn handle_text(&self, conn_id: ConnectionId, text: &str) {
        if self.config.debug_websocket {
            debug!(conn_id, frame = %text, "ws recv");
        }
        match decode::<ClientMessage>(text) {
            Ok(msg) => self.dispatch_message(conn_id, msg).await,
            Err(e) => warn!(conn_id, error = %e, "dropping malformed envelope"),
        }
    }

    async fn dispatch_message(&self, conn_id: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Terminal(request) => self.handle_terminal(conn_id, request).await,
            ClientMessage::Heartbeat { timestamp } => {
                let server_time = now_millis();
                self.connections
                    .send(
                        conn_id,
                        ServerMessage::HeartbeatResponse {
                            timestamp: timestamp.unwrap_or(server_time),
                            server_time,
                        },
                    )
                    .await;
            }
            ClientMessage::Other => {
                debug!(conn_id, "ignoring non-terminal envelope");
            }
        }
    }

    async fn handle_terminal(&self, conn_id: ConnectionId, request: TerminalRequest) {
        let action = request.action();
        trace!(conn_id, action, session_id = ?request.session_id(), "terminal request");

        let (session_id, result) = match request {
            TerminalRequest::Create {
                session_id,
                cols,
                rows,
            } => {
                let id = session_id.unwrap_or_else(generate_session_id);
                let cols = cols.unwrap_or(DEFAULT_COLS).max(1);
                let rows = rows.unwrap_or(DEFAULT_ROWS).max(1);
                let result = self.sessions.create(&id, cols, rows, conn_id).await;
                (id, result.map(|_| ()))
            }
            TerminalRequest::Check { session_id } => {
                self.sessions.check(&session_id, conn_id).await;
                (session_id, Ok(()))
            }
            TerminalRequest::Input { session_id, input } => {
                let result = self.sessions.input(&session_id, input.into_bytes()).await;
                (session_id, result)
            }
            TerminalRequest::Resize {
                session_id,
                cols,
                rows,
            } => {
                let allowed = self.resize_limits.lock().await.check_and_record(&session_id);
                let result = if allowed {
                    self.sessions.resize(&session_id, cols.max(1), rows.max(1)).await
                } else {
                    debug!(session_id = %session_id, "resize rate-limited");
                    Ok(())
                };
                (session_id, result)
            }
            TerminalRequest::Destroy { session_id } => {
                self.sessions.destroy(&session_id).await;
                self.resize_limits.lock().await.forget(&session_id);
                (session_id, Ok(()))
            }
        };

        if let Err(e) = result {
            warn!(conn_id, action, session_id = %session_id, error = %e, "terminal request failed");
            self.connections
                .send(
                    conn_id,
                    TerminalEvent::Error {
                        session_id,
                        message: e.to_string(),
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DisconnectPolicy;
    use crate::session::mock::MockBackend;
    use futures_util::SinkExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tour_core::encode;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            shell: Some("/bin/sh".into()),
            workdir: std::env::temp_dir(),
            ..ServerConfig::default()
        }
    }

    async fn start(
        config: ServerConfig,
        backend: Arc<dyn PtyBackend>,
    ) -> (Arc<TourServer>, SocketAddr) {
        let server = Arc::new(TourServer::with_backend(config, backend));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: impl Into<ClientMessage>) {
        let text = encode(&msg.into()).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn send_raw(ws: &mut Client, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return decode(text.as_str()).unwrap();
            }
        }
    }

    async fn recv_terminal(ws: &mut Client) -> TerminalEvent {
        match recv(ws).await {
            ServerMessage::Terminal(event) => event,
            other => panic!("expected terminal event, got {other:?}"),
        }
    }

    fn create(id: &str) -> TerminalRequest {
        TerminalRequest::Create {
            session_id: Some(id.into()),
            cols: Some(80),
            rows: Some(24),
        }
    }

    #[tokio::test]
    async fn heartbeat_is_answered_to_sender() {
        let (_server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let mut ws = connect(addr).await;
        send(&mut ws, ClientMessage::Heartbeat { timestamp: Some(7) }).await;
        match recv(&mut ws).await {
            ServerMessage::HeartbeatResponse { timestamp, server_time } => {
                assert_eq!(timestamp, 7);
                assert!(server_time > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_and_unknown_envelopes_keep_connection_open() {
        let (_server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let mut ws = connect(addr).await;
        send_raw(&mut ws, "not json at all").await;
        send_raw(&mut ws, r#"{"type":"terminal","action":"explode"}"#).await;
        send_raw(&mut ws, r#"{"type":"exercise_view","exercise_id":"ch01/ex01"}"#).await;
        send(&mut ws, ClientMessage::Heartbeat { timestamp: Some(1) }).await;
        assert!(matches!(
            recv(&mut ws).await,
            ServerMessage::HeartbeatResponse { timestamp: 1, .. }
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped_and_connection_stays_open() {
        let (_server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let mut ws = connect(addr).await;
        let huge = format!(
            r#"{{"type":"heartbeat","timestamp":1,"pad":"{}"}}"#,
            "x".repeat(2 * 1_048_576)
        );
        send_raw(&mut ws, &huge).await;
        send(&mut ws, ClientMessage::Heartbeat { timestamp: Some(2) }).await;
        assert!(matches!(
            recv(&mut ws).await,
            ServerMessage::HeartbeatResponse { timestamp: 2, .. }
        ));
    }

    #[tokio::test]
    async fn other_paths_are_rejected() {
        let (_server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_unknown_reports_not_found() {
        let backend = Arc::new(MockBackend::new());
        let (server, addr) = start(test_config(), backend.clone()).await;
        let mut ws = connect(addr).await;
        send(&mut ws, TerminalRequest::Check { session_id: "ghost".into() }).await;
        assert_eq!(
            recv_terminal(&mut ws).await,
            TerminalEvent::NotFound { session_id: "ghost".into() }
        );
        assert_eq!(backend.spawn_count(), 0);
        assert_eq!(server.sessions().count().await, 0);
    }

    #[tokio::test]
    async fn create_without_id_gets_generated_one() {
        let (_server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let mut ws = connect(addr).await;
        send(
            &mut ws,
            TerminalRequest::Create {
                session_id: None,
                cols: None,
                rows: None,
            },
        )
        .await;
        match recv_terminal(&mut ws).await {
            TerminalEvent::Created { session_id } => assert_eq!(session_id.len(), 32),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_becomes_error_envelope() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_spawns();
        let (_server, addr) = start(test_config(), backend).await;
        let mut ws = connect(addr).await;
        send(&mut ws, create("t1")).await;
        match recv_terminal(&mut ws).await {
            TerminalEvent::Error { session_id, message } => {
                assert_eq!(session_id, "t1");
                assert!(message.contains("spawn"), "message = {message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reload_reattaches_to_same_process() {
        let backend = Arc::new(MockBackend::new());
        let (server, addr) = start(test_config(), backend.clone()).await;

        let mut first = connect(addr).await;
        send(&mut first, create("t1")).await;
        recv_terminal(&mut first).await;
        drop(first);

        // Give the server a moment to notice the close.
        for _ in 0..50 {
            if server.connections().count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.sessions().count().await, 1);

        let mut second = connect(addr).await;
        send(&mut second, TerminalRequest::Check { session_id: "t1".into() }).await;
        assert_eq!(
            recv_terminal(&mut second).await,
            TerminalEvent::Exists { session_id: "t1".into() }
        );
        backend.process(0).emit(b"still here");
        assert_eq!(
            recv_terminal(&mut second).await,
            TerminalEvent::Output {
                session_id: "t1".into(),
                data: "still here".into()
            }
        );
        assert_eq!(backend.spawn_count(), 1);
    }

    #[tokio::test]
    async fn kill_policy_reaps_on_disconnect() {
        let backend = Arc::new(MockBackend::new());
        let config = ServerConfig {
            on_disconnect: DisconnectPolicy::Kill,
            ..test_config()
        };
        let (server, addr) = start(config, backend.clone()).await;

        let mut ws = connect(addr).await;
        send(&mut ws, create("t1")).await;
        recv_terminal(&mut ws).await;
        ws.close(None).await.unwrap();

        for _ in 0..50 {
            if server.sessions().count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.sessions().count().await, 0);
        assert_eq!(backend.process(0).kills(), 1);
    }

    #[tokio::test]
    async fn resize_floods_are_limited() {
        let backend = Arc::new(MockBackend::new());
        let config = ServerConfig {
            resize_per_second: 2,
            ..test_config()
        };
        let (_server, addr) = start(config, backend.clone()).await;
        let mut ws = connect(addr).await;
        send(&mut ws, create("t1")).await;
        recv_terminal(&mut ws).await;

        for cols in [100, 110, 120] {
            send(
                &mut ws,
                TerminalRequest::Resize {
                    session_id: "t1".into(),
                    cols,
                    rows: 30,
                },
            )
            .await;
        }
        // Requests on one connection are handled in order; a heartbeat
        // round trip means all three resizes were processed.
        send(&mut ws, ClientMessage::Heartbeat { timestamp: None }).await;
        recv(&mut ws).await;
        assert_eq!(backend.process(0).size(), (110, 30));
    }

    #[tokio::test]
    async fn shutdown_notifies_clients() {
        let (server, addr) = start(test_config(), Arc::new(MockBackend::new())).await;
        let mut ws = connect(addr).await;
        for _ in 0..50 {
            if server.connections().count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.shutdown().await;
        match recv(&mut ws).await {
            ServerMessage::SystemNotification { level, .. } => {
                assert_eq!(level, NotificationLevel::Warning)
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::timeout(Duration::from_secs(5), server.wait_drained())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_shell_round_trip() {
        let (_server, addr) = start(test_config(), Arc::new(NativePtyBackend)).await;
        let mut ws = connect(addr).await;

        send(&mut ws, create("e2e")).await;
        assert_eq!(
            recv_terminal(&mut ws).await,
            TerminalEvent::Created { session_id: "e2e".into() }
        );

        send(
            &mut ws,
            TerminalRequest::Input {
                session_id: "e2e".into(),
                input: "echo tour-$((6*7))\n".into(),
            },
        )
        .await;

        let mut output = String::new();
        while !output.contains("tour-42") {
            match recv_terminal(&mut ws).await {
                TerminalEvent::Output { session_id, data } => {
                    assert_eq!(session_id, "e2e");
                    output.push_str(&data);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        send(
            &mut ws,
            TerminalRequest::Input {
                session_id: "e2e".into(),
                input: "exit 5\n".into(),
            },
        )
        .await;
        let code = loop {
            match recv_terminal(&mut ws).await {
                TerminalEvent::Output { .. } => continue,
                TerminalEvent::Exit { session_id, code } => {
                    assert_eq!(session_id, "e2e");
                    break code;
                }
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(code, Some(5));

        // The exited id is gone; a fresh create spawns a new shell.
        send(&mut ws, TerminalRequest::Check { session_id: "e2e".into() }).await;
        assert_eq!(
            recv_terminal(&mut ws).await,
            TerminalEvent::NotFound { session_id: "e2e".into() }
        );
        send(&mut ws, create("e2e")).await;
        assert_eq!(
            recv_terminal(&mut ws).await,
            TerminalEvent::Created { session_id: "e2e".into() }
        );
    }
}
