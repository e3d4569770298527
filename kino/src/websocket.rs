//! WebSocket endpoints
//!
//! - `/ws/{room_code}`: room channel, inbound text is relayed to every client in the room
//! - `/ws/events`: read-only feed of video status events
//!
//! The room loop itself lives in [`RoomConnectionManager`]; this module only
//! adapts axum's WebSocket to [`RoomTransport`].

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kino_cluster::{RoomConnectionManager, RoomTransport};

use crate::server::AppState;

/// Limit max message size to 64KB (default is 64MB which is excessive for room traffic)
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Outbound frames buffered per client before it is considered too slow
const SEND_BUFFER: usize = 256;

/// How long queued frames may take to flush once the connection is closing
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// WebSocket adapter implementing [`RoomTransport`]
struct WebSocketTransport {
    receiver: SplitStream<WebSocket>,
    sender: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
}

impl WebSocketTransport {
    fn new(socket: WebSocket) -> Self {
        let (sink, receiver) = socket.split();
        let (sender, rx) = mpsc::channel(SEND_BUFFER);
        let writer = tokio::spawn(Self::write_loop(sink, rx));
        Self {
            receiver,
            sender,
            writer,
        }
    }

    async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    }

    /// Send a close frame and give queued frames [`CLOSE_GRACE`] to flush
    async fn close(self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        shutdown_writer(self.sender, self.writer, Message::Close(Some(frame)), CLOSE_GRACE).await;
    }
}

/// Queue `frame` without waiting for room, then wait up to `grace` for the
/// writer to drain. A writer still stuck on a peer that stopped reading is
/// aborted, which drops the socket. Returns whether the writer finished.
async fn shutdown_writer(
    sender: mpsc::Sender<Message>,
    mut writer: JoinHandle<()>,
    frame: Message,
    grace: Duration,
) -> bool {
    if let Err(e) = sender.try_send(frame) {
        debug!(error = %e, "Close frame not queued");
    }
    drop(sender);

    match tokio::time::timeout(grace, &mut writer).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "WebSocket writer task ended abnormally");
            true
        }
        Err(_) => {
            warn!(grace = ?grace, "WebSocket writer did not flush, aborting");
            writer.abort();
            false
        }
    }
}

#[async_trait]
impl RoomTransport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                // Binary, ping and pong frames carry no room traffic
                Some(Ok(_)) => {}
            }
        }
    }

    fn send(&self, message: String) -> Result<(), String> {
        // try_send: a client that stops reading is disconnected instead of buffering forever
        self.sender
            .try_send(Message::Text(message.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    "Channel full: WebSocket client too slow to consume messages".to_string()
                }
                mpsc::error::TrySendError::Closed(_) => {
                    "Channel closed: WebSocket client disconnected".to_string()
                }
            })
    }
}

/// WebSocket handler for a room
pub async fn room_socket(
    State(state): State<AppState>,
    Path(room_code): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_room_socket(socket, state.connections, room_code))
}

async fn handle_room_socket(socket: WebSocket, connections: RoomConnectionManager, room_code: String) {
    let mut transport = WebSocketTransport::new(socket);
    match connections.serve(&room_code, &mut transport).await {
        Ok(()) => {
            info!(room_code = %room_code, "Room WebSocket closed");
            transport.close(close_code::NORMAL, "").await;
        }
        Err(e) => {
            warn!(error = %e, room_code = %room_code, "Room WebSocket rejected");
            transport.close(close_code::AGAIN, &e.to_string()).await;
        }
    }
}

/// WebSocket handler for the status event feed
pub async fn status_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_status_socket(socket, state.connections))
}

async fn handle_status_socket(socket: WebSocket, connections: RoomConnectionManager) {
    let mut transport = WebSocketTransport::new(socket);
    match connections.serve_status_feed(&mut transport).await {
        Ok(()) => transport.close(close_code::NORMAL, "").await,
        Err(e) => {
            warn!(error = %e, "Status feed WebSocket rejected");
            transport.close(close_code::AGAIN, &e.to_string()).await;
        }
    }
}
