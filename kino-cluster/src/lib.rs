pub mod bus;
pub mod connection_manager;
pub mod error;
pub mod messages;

pub use bus::{BroadcastBackend, BroadcastBus, Listener, ListenerId, LocalBus, RedisBus};
pub use connection_manager::{
    ConnectionInfo, ConnectionLimits, ConnectionStats, RoomConnectionManager, RoomTransport,
};
pub use error::{Error, Result};
pub use messages::{BroadcastMessage, Origin};
