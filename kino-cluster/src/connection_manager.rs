//! Room connection manager
//!
//! Owns the lifecycle of every realtime client connection: admission against
//! the configured limits, subscription to the room channel on the bus, relay
//! of inbound client messages and cleanup when the transport goes away.
//!
//! The transport itself is abstracted by [`RoomTransport`] so the same loop
//! serves WebSocket connections and in-process test clients.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kino_core::config::Config;
use kino_core::models::channel_for_code;

use crate::bus::{BroadcastBackend, BroadcastBus, Listener};
use crate::messages::BroadcastMessage;
use crate::{Error, Result};

/// Bidirectional text transport for one client
#[async_trait]
pub trait RoomTransport: Send {
    /// Receive the next text frame from the client.
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<std::result::Result<String, String>>;

    /// Queue a text frame for the client
    fn send(&self, message: String) -> std::result::Result<(), String>;
}

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub channel: String,
    pub connected_at: Instant,
    pub message_count: u64,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(connection_id: String, channel: String) -> Self {
        Self {
            connection_id,
            channel,
            connected_at: Instant::now(),
            message_count: 0,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Connection limits configuration
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum connections per channel (room)
    pub max_per_room: usize,

    /// Maximum total connections
    pub max_total: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_room: 200,
            max_total: 10000,
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub active_channels: usize,
    pub total_connections: u64,
    pub total_messages: u64,
}

/// Connects realtime clients to room channels on the broadcast bus
#[derive(Clone)]
pub struct RoomConnectionManager {
    bus: BroadcastBus,
    room_channel_prefix: Arc<str>,
    status_channel: Arc<str>,

    /// All active connections by `connection_id`
    connections: Arc<DashMap<String, ConnectionInfo>>,

    /// Active connection count by channel
    channel_connections: Arc<DashMap<String, usize>>,

    limits: Arc<ConnectionLimits>,

    /// Metrics
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl RoomConnectionManager {
    #[must_use]
    pub fn new(
        bus: BroadcastBus,
        room_channel_prefix: impl Into<String>,
        status_channel: impl Into<String>,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            bus,
            room_channel_prefix: Arc::from(room_channel_prefix.into()),
            status_channel: Arc::from(status_channel.into()),
            connections: Arc::new(DashMap::new()),
            channel_connections: Arc::new(DashMap::new()),
            limits: Arc::new(limits),
            total_connections: Arc::new(AtomicU64::new(0)),
            total_messages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build from the `bus` and `server` configuration sections
    #[must_use]
    pub fn from_config(bus: BroadcastBus, config: &Config) -> Self {
        Self::new(
            bus,
            config.bus.room_channel_prefix.clone(),
            config.bus.status_channel.clone(),
            ConnectionLimits {
                max_per_room: config.server.max_connections_per_room,
                max_total: config.server.max_connections,
            },
        )
    }

    #[must_use]
    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Bus channel for a room code
    #[must_use]
    pub fn room_channel(&self, room_code: &str) -> String {
        channel_for_code(&self.room_channel_prefix, room_code)
    }

    /// Admit a connection to `channel`, enforcing limits
    fn register(&self, channel: &str) -> Result<String> {
        if self.connections.len() >= self.limits.max_total {
            return Err(Error::Rejected(format!(
                "Server at capacity ({} connections)",
                self.limits.max_total
            )));
        }

        {
            let mut count = self.channel_connections.entry(channel.to_string()).or_insert(0);
            if *count >= self.limits.max_per_room {
                return Err(Error::Rejected(format!(
                    "Room is full (max {} connections)",
                    self.limits.max_per_room
                )));
            }
            *count += 1;
        }

        let connection_id = nanoid::nanoid!();
        self.connections.insert(
            connection_id.clone(),
            ConnectionInfo::new(connection_id.clone(), channel.to_string()),
        );
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        debug!(connection_id = %connection_id, channel = %channel, "Connection registered");
        Ok(connection_id)
    }

    fn release(&self, connection_id: &str) {
        let Some((_, info)) = self.connections.remove(connection_id) else {
            return;
        };

        if let Some(mut count) = self.channel_connections.get_mut(&info.channel) {
            *count = count.saturating_sub(1);
        }
        self.channel_connections.remove_if(&info.channel, |_, count| *count == 0);

        info!(
            connection_id = %connection_id,
            channel = %info.channel,
            duration_secs = info.duration().as_secs(),
            messages = info.message_count,
            "Connection released"
        );
    }

    async fn attach(&self, channel: &str) -> Result<(String, mpsc::UnboundedReceiver<String>)> {
        let connection_id = self.register(channel)?;
        let (listener, rx) = Listener::new(connection_id.clone());
        if let Err(e) = self.bus.connect(channel, listener).await {
            self.release(&connection_id);
            return Err(e);
        }
        Ok((connection_id, rx))
    }

    async fn detach(&self, channel: &str, connection_id: &str) {
        if let Err(e) = self.bus.disconnect(channel, connection_id).await {
            warn!(error = %e, connection_id = %connection_id, channel = %channel, "Failed to disconnect from bus");
        }
        self.release(connection_id);
    }

    /// Register a connection for `room_code` and subscribe it to the room channel.
    ///
    /// Returns the connection id and the receiver carrying room broadcasts.
    pub async fn open(&self, room_code: &str) -> Result<(String, mpsc::UnboundedReceiver<String>)> {
        let channel = self.room_channel(room_code);
        self.attach(&channel).await
    }

    /// Wrap inbound client text as a peer message and broadcast it to the room.
    /// The sender receives its own message too.
    pub async fn relay(&self, room_code: &str, connection_id: &str, payload: String) -> Result<usize> {
        let channel = self.room_channel(room_code);
        let message = BroadcastMessage::peer(payload).to_json()?;

        if let Some(mut info) = self.connections.get_mut(connection_id) {
            info.message_count += 1;
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);

        self.bus.broadcast(&channel, &message).await
    }

    /// Unsubscribe a connection from its room and release it
    pub async fn close(&self, room_code: &str, connection_id: &str) {
        let channel = self.room_channel(room_code);
        self.detach(&channel, connection_id).await;
    }

    /// Run a room connection until the client goes away
    pub async fn serve<T: RoomTransport>(&self, room_code: &str, transport: &mut T) -> Result<()> {
        let (connection_id, mut rx) = self.open(room_code).await?;
        info!(connection_id = %connection_id, room_code = %room_code, "Client joined room");

        loop {
            tokio::select! {
                inbound = transport.recv() => {
                    match inbound {
                        Some(Ok(text)) => {
                            if let Err(e) = self.relay(room_code, &connection_id, text).await {
                                warn!(error = %e, connection_id = %connection_id, "Failed to relay message");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, connection_id = %connection_id, "Error receiving message");
                            break;
                        }
                        None => {
                            debug!(connection_id = %connection_id, "Client disconnected gracefully");
                            break;
                        }
                    }
                }

                outbound = rx.recv() => {
                    let Some(message) = outbound else {
                        warn!(connection_id = %connection_id, "Bus delivery channel closed");
                        break;
                    };
                    if let Err(e) = transport.send(message) {
                        warn!(error = %e, connection_id = %connection_id, "Failed to send message");
                        break;
                    }
                }
            }
        }

        self.close(room_code, &connection_id).await;
        Ok(())
    }

    /// Run a read-only connection to the global status channel.
    ///
    /// Inbound frames are read only to notice the close and are never relayed.
    pub async fn serve_status_feed<T: RoomTransport>(&self, transport: &mut T) -> Result<()> {
        let channel = self.status_channel.to_string();
        let (connection_id, mut rx) = self.attach(&channel).await?;
        info!(connection_id = %connection_id, "Client subscribed to status feed");

        loop {
            tokio::select! {
                inbound = transport.recv() => {
                    match inbound {
                        Some(Ok(_)) => {
                            debug!(connection_id = %connection_id, "Ignoring message on read-only status feed");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, connection_id = %connection_id, "Error receiving message");
                            break;
                        }
                        None => break,
                    }
                }

                outbound = rx.recv() => {
                    let Some(message) = outbound else { break };
                    if let Err(e) = transport.send(message) {
                        warn!(error = %e, connection_id = %connection_id, "Failed to send status event");
                        break;
                    }
                }
            }
        }

        self.detach(&channel, &connection_id).await;
        Ok(())
    }

    /// Number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of active connections in a room
    #[must_use]
    pub fn room_connection_count(&self, room_code: &str) -> usize {
        self.channel_connections
            .get(&self.room_channel(room_code))
            .map_or(0, |count| *count)
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|info| info.clone())
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.connections.len(),
            active_channels: self.channel_connections.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}
