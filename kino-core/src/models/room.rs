use serde::{Deserialize, Serialize};

use super::id::{RoomId, VideoId};

/// A watch room. Rooms exist independently of any video's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    /// Human-chosen code that clients use to join
    pub code: String,
    pub video_id: Option<VideoId>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            video_id: None,
        }
    }

    /// Bus channel carrying this room's messages
    #[must_use]
    pub fn channel(&self, prefix: &str) -> String {
        channel_for_code(prefix, &self.code)
    }
}

/// Bus channel name for a room code: `{prefix}:{code}`
#[must_use]
pub fn channel_for_code(prefix: &str, code: &str) -> String {
    format!("{prefix}:{code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_channel() {
        let mut room = Room::new(RoomId(1), "movie-night");
        room.video_id = Some(VideoId(7));
        assert_eq!(room.channel("room"), "room:movie-night");
        assert_eq!(channel_for_code("room", "R1"), "room:R1");
    }
}
