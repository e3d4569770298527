//! Video record persistence

mod memory;
mod video;

use async_trait::async_trait;

use crate::models::{Video, VideoId};
use crate::Result;

pub use memory::MemoryStatusStore;
pub use video::VideoRepository;

/// Status store contract consumed by the transcode pipeline
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Load a video record. Unknown ids yield `Error::NotFound`.
    async fn load(&self, id: VideoId) -> Result<Video>;

    /// Insert or update a video record
    async fn save(&self, video: &Video) -> Result<()>;
}
