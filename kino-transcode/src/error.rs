//! Step errors observed while handling one transcode job

use thiserror::Error;

/// A failure inside one step of a job run.
///
/// None of these escape [`crate::TranscodeWorker::handle`]; they are collected
/// into the [`crate::JobReport`]. `TransientInfra` and `Storage` end the run as
/// `failed`; the others are recorded and the run goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Source object or scratch space could not be prepared
    #[error("Failed to fetch source {key}: {message}")]
    TransientInfra { key: String, message: String },

    /// No usable encoder; renditions fall back to placeholders
    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    /// The encoder ran but did not produce a rendition
    #[error("Encoder failed for {rendition}: {message}")]
    EncoderExecution { rendition: String, message: String },

    /// Loading or saving the video record failed
    #[error("Status persistence failed: {0}")]
    Persistence(String),

    /// Writing, uploading or presigning generated output failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A status event could not be published
    #[error("Failed to publish status event: {0}")]
    Publish(String),
}

impl StepError {
    pub(crate) fn fetch(key: &str, err: impl std::fmt::Display) -> Self {
        Self::TransientInfra {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn storage(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{key}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_message_names_the_key() {
        let err = StepError::storage("hls/a/master.m3u8", "denied");
        assert_eq!(err.to_string(), "Storage error: hls/a/master.m3u8: denied");
    }

    #[test]
    fn test_messages_name_the_object() {
        let err = StepError::fetch("videos/a.mp4", "not found");
        assert_eq!(err.to_string(), "Failed to fetch source videos/a.mp4: not found");
    }
}
