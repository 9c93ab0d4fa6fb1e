//! Per-connection pipeline
//!
//! Drives one client from TCP accept through the upgrade handshake, the
//! frame dispatch loop, and teardown. Each connection gets a reader (this
//! task) and a writer task fed by the connection's outbound channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};

use super::handshake::negotiate;
use super::protocol::{RelayMessage, MAX_MESSAGE_BYTES};
use crate::relay::{BroadcastRegistry, Connection};

/// What the dispatcher decided about the connection after one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    /// Keep reading frames
    Continue,
    /// Stop reading and tear the connection down
    Close,
}

/// Frame size limits applied to every accepted connection
fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_BYTES);
    config.max_frame_size = Some(MAX_MESSAGE_BYTES);
    config
}

/// Drive one client connection through its full lifecycle
///
/// Faults are local to this connection: every exit path deregisters it and
/// lets the caller's task end quietly.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<BroadcastRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let connection = Arc::new(Connection::new(peer));
    info!("Connection {} accepted from {}", connection.id(), peer);

    let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        negotiate,
        Some(socket_config()),
    )
    .await
    {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            if let Err(e) = connection.finalize().await {
                warn!("Connection {} teardown error: {}", connection.id(), e);
            }
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Writer task: everything queued on the outbound channel is written in
    // order, and remaining frames still drain after the sender side drops.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Err(e) = connection.upgrade(outbound_tx).await {
        warn!(
            "Connection {} upgrade bookkeeping failed: {}",
            connection.id(),
            e
        );
        let _ = writer.await;
        return;
    }
    registry.add(Arc::clone(&connection)).await;
    info!(
        "Connection {} upgraded ({} active)",
        connection.id(),
        registry.connection_count()
    );

    // Read frames until the peer closes, an error occurs, or the server
    // shuts down
    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if dispatch_frame(&connection, &registry, frame).await == FrameOutcome::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Connection {} read error: {}", connection.id(), e);
                        break;
                    }
                    None => {
                        debug!("Connection {} stream ended", connection.id());
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Connection {} closing for shutdown", connection.id());
                let _ = connection.send(Message::Close(None)).await;
                break;
            }
        }
    }

    teardown(&connection, &registry, writer).await;
}

/// Route one inbound frame
///
/// Text fans out through the registry, ping is answered in place, and
/// binary violates the text-only policy and closes the connection.
async fn dispatch_frame(
    connection: &Connection,
    registry: &BroadcastRegistry,
    frame: Message,
) -> FrameOutcome {
    match frame {
        Message::Text(text) => {
            debug!("Connection {} relayed {} bytes", connection.id(), text.len());
            registry
                .broadcast(RelayMessage::new(connection.id(), text))
                .await;
            FrameOutcome::Continue
        }
        Message::Ping(payload) => {
            if connection.send(Message::Pong(payload)).await.is_err() {
                return FrameOutcome::Close;
            }
            FrameOutcome::Continue
        }
        Message::Pong(_) => FrameOutcome::Continue,
        Message::Binary(data) => {
            warn!(
                "Connection {} sent a binary frame ({} bytes); only text is relayed",
                connection.id(),
                data.len()
            );
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Unsupported,
                reason: "only text frames are relayed".into(),
            }));
            let _ = connection.send(close).await;
            FrameOutcome::Close
        }
        Message::Close(frame) => {
            debug!("Connection {} requested close", connection.id());
            let _ = connection.send(Message::Close(frame)).await;
            FrameOutcome::Close
        }
        Message::Frame(_) => {
            // Raw frames never surface from the stream reader
            FrameOutcome::Continue
        }
    }
}

/// Deregister, run the close transitions, and wait for the writer to drain
///
/// Registry removal comes first so no fan-out can observe a closed member;
/// queued frames (close acknowledgements included) are still written before
/// the writer exits.
async fn teardown(
    connection: &Connection,
    registry: &BroadcastRegistry,
    writer: JoinHandle<()>,
) {
    registry.remove(connection.id()).await;
    debug!(
        "Connection {} tearing down from state {}",
        connection.id(),
        connection.state().await
    );

    if let Err(e) = connection.begin_close().await {
        warn!("Connection {} close transition failed: {}", connection.id(), e);
    }
    if let Err(e) = connection.finalize().await {
        warn!("Connection {} teardown error: {}", connection.id(), e);
    }
    let _ = writer.await;

    info!(
        "Connection {} closed after {:?} ({} active)",
        connection.id(),
        connection.age(),
        registry.connection_count()
    );
}
