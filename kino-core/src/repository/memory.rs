use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::StatusStore;
use crate::models::{Video, VideoId, VideoStatus};
use crate::{Error, Result};

/// In-process status store, used when no database is configured and in tests.
///
/// Keeps the history of saved statuses per video so callers can inspect the
/// sequence of transitions.
#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    videos: HashMap<VideoId, Video>,
    history: HashMap<VideoId, Vec<VideoStatus>>,
}

impl MemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without recording it in the history
    pub fn insert(&self, video: Video) {
        self.inner.lock().videos.insert(video.id, video);
    }

    #[must_use]
    pub fn get(&self, id: VideoId) -> Option<Video> {
        self.inner.lock().videos.get(&id).cloned()
    }

    /// Statuses saved for `id`, oldest first
    #[must_use]
    pub fn history(&self, id: VideoId) -> Vec<VideoStatus> {
        self.inner.lock().history.get(&id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, id: VideoId) -> Result<Video> {
        self.get(id).ok_or_else(|| Error::NotFound(format!("video {id}")))
    }

    async fn save(&self, video: &Video) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.history.entry(video.id).or_default().push(video.status());
        inner.videos.insert(video.id, video.clone());
        Ok(())
    }
}
