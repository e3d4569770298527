use serde::{Deserialize, Serialize};

/// Who produced a room message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Relayed from a connected client
    Peer,
    /// Produced by the server itself
    Server,
}

/// Message carried on a room channel: `{"from":"peer","payload":"..."}`.
///
/// The payload is opaque to the server; clients usually put JSON-encoded
/// playback or chat state in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub from: Origin,
    pub payload: String,
}

impl BroadcastMessage {
    #[must_use]
    pub fn peer(payload: impl Into<String>) -> Self {
        Self {
            from: Origin::Peer,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn server(payload: impl Into<String>) -> Self {
        Self {
            from: Origin::Server,
            payload: payload.into(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
