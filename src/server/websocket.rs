//! WebSocket relay server
//!
//! Owns the listener, the shared broadcast registry, and the shutdown
//! channel. Every accepted socket is handed to the connection pipeline on
//! its own task; the registry is the only state those tasks share.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::handler::handle_connection;
use super::protocol::WEBSOCKET_PATH;
use crate::relay::BroadcastRegistry;

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket relay server: accept loop plus the shared registry
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<BroadcastRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a server with its own registry
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(BroadcastRegistry::new()))
    }

    /// Create a server around an existing registry
    pub fn with_registry(config: ServerConfig, registry: Arc<BroadcastRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("Relay listening on ws://{}{}", addr, WEBSOCKET_PATH);

        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections until the shutdown signal fires
    async fn serve(&self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(handle_connection(stream, peer, registry, shutdown_rx));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let remaining = self.registry.connection_count();
        if remaining > 0 {
            info!("Shutting down with {} connection(s) still open", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::super::protocol::PAYLOAD_SEPARATOR;

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (SocketAddr, Arc<BroadcastRegistry>, Arc<RelayServer>) {
        let registry = Arc::new(BroadcastRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ServerConfig::new("127.0.0.1".to_string(), addr.port());
        let server = Arc::new(RelayServer::with_registry(config, Arc::clone(&registry)));

        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving.serve(listener).await;
        });

        (addr, registry, server)
    }

    fn ws_url(addr: SocketAddr) -> String {
        format!("ws://{}{}", addr, WEBSOCKET_PATH)
    }

    async fn wait_for_count(registry: &BroadcastRegistry, expected: usize) {
        for _ in 0..100 {
            if registry.connection_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "registry never reached {} connection(s), still at {}",
            expected,
            registry.connection_count()
        );
    }

    async fn next_frame(ws: &mut WsClient) -> Message {
        timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended unexpectedly")
            .expect("read error")
    }

    async fn next_text(ws: &mut WsClient) -> String {
        match next_frame(ws).await {
            Message::Text(line) => line,
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config_socket_addr() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = RelayServer::new(ServerConfig::new("127.0.0.1".to_string(), addr.port()));
        let err = server.run().await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }

    // -------------------------------------------------------------------------
    // Broadcast delivery
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sender_receives_own_message() {
        let (addr, registry, _server) = start_server().await;

        let (mut ws, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 1).await;

        ws.send(Message::Text("hello".into())).await.unwrap();
        let line = next_text(&mut ws).await;
        assert!(line.ends_with("hello"));
        assert!(line.contains(PAYLOAD_SEPARATOR));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let (addr, registry, _server) = start_server().await;

        let (mut first, _) = connect_async(ws_url(addr)).await.unwrap();
        let (mut second, _) = connect_async(ws_url(addr)).await.unwrap();
        let (mut third, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 3).await;

        first.send(Message::Text("to everyone".into())).await.unwrap();

        for ws in [&mut first, &mut second, &mut third] {
            let line = next_text(ws).await;
            assert!(line.ends_with("to everyone"));
        }
    }

    #[tokio::test]
    async fn test_each_client_receives_every_message() {
        const CLIENTS: usize = 5;
        let (addr, registry, _server) = start_server().await;

        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            let (ws, _) = connect_async(ws_url(addr)).await.unwrap();
            clients.push(ws);
        }
        wait_for_count(&registry, CLIENTS).await;

        for (i, ws) in clients.iter_mut().enumerate() {
            ws.send(Message::Text(format!("message-{}", i)))
                .await
                .unwrap();
        }

        // Every client sees one line per sender, itself included, with no
        // duplicates and no drops
        for ws in &mut clients {
            let mut lines = Vec::new();
            for _ in 0..CLIENTS {
                lines.push(next_text(ws).await);
            }
            for i in 0..CLIENTS {
                let body = format!("message-{}", i);
                assert_eq!(
                    lines.iter().filter(|line| line.ends_with(&body)).count(),
                    1,
                    "expected exactly one copy of {:?}",
                    body
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Control frames and content policy
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping_answered_never_broadcast() {
        let (addr, registry, _server) = start_server().await;

        let (mut pinger, _) = connect_async(ws_url(addr)).await.unwrap();
        let (mut observer, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 2).await;

        pinger.send(Message::Ping(b"beat".to_vec())).await.unwrap();

        match next_frame(&mut pinger).await {
            Message::Pong(payload) => assert_eq!(payload, b"beat".to_vec()),
            other => panic!("Expected pong, got {:?}", other),
        }

        let quiet = timeout(Duration::from_millis(200), observer.next()).await;
        assert!(quiet.is_err(), "ping must not reach other connections");
    }

    #[tokio::test]
    async fn test_binary_frame_triggers_unsupported_close() {
        let (addr, registry, _server) = start_server().await;

        let (mut offender, _) = connect_async(ws_url(addr)).await.unwrap();
        let (mut bystander, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 2).await;

        offender.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        match next_frame(&mut offender).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("Expected unsupported-data close, got {:?}", other),
        }
        wait_for_count(&registry, 1).await;

        // The bystander is unaffected and still receives broadcasts
        bystander
            .send(Message::Text("unaffected".into()))
            .await
            .unwrap();
        let line = next_text(&mut bystander).await;
        assert!(line.ends_with("unaffected"));
    }

    // -------------------------------------------------------------------------
    // Handshake and lifecycle
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_close_is_acknowledged() {
        let (addr, registry, _server) = start_server().await;

        let (mut ws, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 1).await;

        ws.close(None).await.unwrap();

        let frame = next_frame(&mut ws).await;
        assert!(matches!(frame, Message::Close(_)));
        wait_for_count(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_membership() {
        let (addr, registry, _server) = start_server().await;

        let (mut kept, _) = connect_async(ws_url(addr)).await.unwrap();
        let (mut leaving, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 2).await;

        leaving.close(None).await.unwrap();
        wait_for_count(&registry, 1).await;

        kept.send(Message::Text("still here".into())).await.unwrap();
        let line = next_text(&mut kept).await;
        assert!(line.ends_with("still here"));
    }

    #[tokio::test]
    async fn test_wrong_path_rejected_with_bad_request() {
        let (addr, registry, _server) = start_server().await;

        let err = connect_async(format!("ws://{}/other", addr)).await.unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
            other => panic!("Expected HTTP rejection, got {:?}", other),
        }
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_http_request_closed_without_upgrade() {
        let (addr, registry, _server) = start_server().await;

        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", WEBSOCKET_PATH);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
            .await
            .expect("server should close the connection")
            .unwrap();

        let response = String::from_utf8_lossy(&response);
        assert!(!response.contains("101 Switching Protocols"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_stops_accepting() {
        let (addr, registry, server) = start_server().await;

        let (mut ws, _) = connect_async(ws_url(addr)).await.unwrap();
        wait_for_count(&registry, 1).await;

        server.shutdown();

        let frame = next_frame(&mut ws).await;
        assert!(matches!(frame, Message::Close(_)));

        // Once the accept loop exits, new connections are refused
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(connect_async(ws_url(addr)).await.is_err());
    }
}
