use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::VideoId;
use crate::{Error, Result};

/// Lifecycle state of an uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    #[default]
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl VideoStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown video status '{other}'"))),
        }
    }
}

/// A stored video and its transcoding state.
///
/// `master_url` is present exactly when `status` is [`VideoStatus::Ready`]; the
/// transition methods are the only way to change either field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Video {
    pub id: VideoId,
    pub source_key: String,
    status: VideoStatus,
    master_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Video {
    #[must_use]
    pub fn new(id: VideoId, source_key: impl Into<String>) -> Self {
        Self {
            id,
            source_key: source_key.into(),
            status: VideoStatus::Uploaded,
            master_url: None,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a record read back from storage, rejecting rows that break the
    /// status/URL invariant.
    pub fn from_parts(
        id: VideoId,
        source_key: String,
        status: VideoStatus,
        master_url: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        if (status == VideoStatus::Ready) != master_url.is_some() {
            return Err(Error::InvalidInput(format!(
                "video {id}: status {status} inconsistent with master url presence"
            )));
        }
        Ok(Self {
            id,
            source_key,
            status,
            master_url,
            created_at,
        })
    }

    #[must_use]
    pub const fn status(&self) -> VideoStatus {
        self.status
    }

    #[must_use]
    pub fn master_url(&self) -> Option<&str> {
        self.master_url.as_deref()
    }

    /// Begin a job run. Allowed from any state; a new run resets a terminal record.
    pub fn start_processing(&mut self) {
        self.status = VideoStatus::Processing;
        self.master_url = None;
    }

    pub fn mark_ready(&mut self, master_url: impl Into<String>) -> Result<()> {
        if self.status != VideoStatus::Processing {
            return Err(Error::InvalidInput(format!(
                "video {}: cannot become ready from {}",
                self.id, self.status
            )));
        }
        self.status = VideoStatus::Ready;
        self.master_url = Some(master_url.into());
        Ok(())
    }

    pub fn mark_failed(&mut self) -> Result<()> {
        if self.status == VideoStatus::Ready {
            return Err(Error::InvalidInput(format!(
                "video {}: cannot fail after becoming ready",
                self.id
            )));
        }
        self.status = VideoStatus::Failed;
        self.master_url = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_run_transitions() {
        let mut video = Video::new(VideoId(1), "videos/a.mp4");
        assert_eq!(video.status(), VideoStatus::Uploaded);

        video.start_processing();
        assert_eq!(video.status(), VideoStatus::Processing);
        assert!(video.master_url().is_none());

        video.mark_ready("http://cdn/hls/a/master.m3u8").unwrap();
        assert_eq!(video.status(), VideoStatus::Ready);
        assert_eq!(video.master_url(), Some("http://cdn/hls/a/master.m3u8"));
        assert!(video.status().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_sticky_within_a_run() {
        let mut video = Video::new(VideoId(2), "videos/b.mp4");
        assert!(video.mark_ready("url").is_err());

        video.start_processing();
        video.mark_ready("url").unwrap();
        assert!(video.mark_failed().is_err());

        // a new run resets the record
        video.start_processing();
        assert!(video.master_url().is_none());
        video.mark_failed().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        assert!(video.mark_ready("url").is_err());
    }

    #[test]
    fn test_from_parts_enforces_url_invariant() {
        let now = Utc::now();
        assert!(Video::from_parts(VideoId(3), "k".into(), VideoStatus::Ready, None, now).is_err());
        assert!(Video::from_parts(
            VideoId(3),
            "k".into(),
            VideoStatus::Failed,
            Some("url".into()),
            now
        )
        .is_err());
        assert!(Video::from_parts(VideoId(3), "k".into(), VideoStatus::Processing, None, now).is_ok());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            VideoStatus::Uploaded,
            VideoStatus::Processing,
            VideoStatus::Ready,
            VideoStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<VideoStatus>().unwrap(), status);
        }
        assert!("done".parse::<VideoStatus>().is_err());
    }
}
