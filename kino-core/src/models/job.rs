use serde::{Deserialize, Serialize};

use super::id::VideoId;
use crate::Result;

/// A request to transcode one uploaded source object into HLS renditions.
///
/// Re-running a job for the same `storage_key` writes the same destination
/// keys, so delivering it more than once is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub storage_key: String,
    #[serde(default)]
    pub video_id: Option<VideoId>,
    /// Skip the encoder and emit placeholder renditions
    #[serde(default)]
    pub simulate: bool,
}

impl TranscodeJob {
    #[must_use]
    pub fn new(storage_key: impl Into<String>, video_id: Option<VideoId>) -> Self {
        Self {
            storage_key: storage_key.into(),
            video_id,
            simulate: false,
        }
    }

    #[must_use]
    pub fn simulated(mut self) -> Self {
        self.simulate = true;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
