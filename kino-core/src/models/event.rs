use serde::{Deserialize, Serialize};

use super::id::VideoId;
use super::video::{Video, VideoStatus};

/// Discriminator carried in every status event
pub const STATUS_EVENT_KIND: &str = "video_status";

/// Pipeline status change, published on the global status channel.
///
/// Serialized as `{"kind":"video_status","id":7,"status":"ready","masterUrl":"..."}`;
/// `masterUrl` is omitted unless the video is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub kind: String,
    pub id: VideoId,
    pub status: VideoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
}

impl StatusEvent {
    #[must_use]
    pub fn new(id: VideoId, status: VideoStatus, master_url: Option<String>) -> Self {
        Self {
            kind: STATUS_EVENT_KIND.to_string(),
            id,
            status,
            master_url,
        }
    }

    /// Snapshot of a video's current state
    #[must_use]
    pub fn for_video(video: &Video) -> Self {
        Self::new(video.id, video.status(), video.master_url().map(str::to_string))
    }
}
