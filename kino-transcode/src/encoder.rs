//! Rendition encoders
//!
//! [`FfmpegEncoder`] drives an external `ffmpeg` binary. When no usable binary
//! is found, or a job asks for simulation, [`write_placeholder`] produces a
//! deterministic stand-in rendition instead.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use kino_core::config::WorkerConfig;

use crate::error::StepError;
use crate::playlist::{vod_playlist, SEGMENT_SECONDS};
use crate::rendition::{segment_name, Rendition, PLAYLIST_FILE};

/// Segments written by [`write_placeholder`]
pub const PLACEHOLDER_SEGMENTS: usize = 3;

/// Timeout for the `-version` probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces the HLS files of one rendition into a local directory:
/// `playlist.m3u8` plus the `seg_NNN.ts` files it references.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Whether [`Encoder::encode`] can be attempted at all
    fn is_available(&self) -> bool;

    async fn encode(&self, source: &Path, rendition: &Rendition, output_dir: &Path) -> Result<(), StepError>;
}

/// Encoder backed by the `ffmpeg` command line tool
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: Option<PathBuf>,
    timeout: Duration,
}

impl FfmpegEncoder {
    /// Locate ffmpeg (configured path first, then `PATH`) and check that it runs
    pub async fn detect(config: &WorkerConfig) -> Self {
        let configured = config
            .ffmpeg_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists());

        let resolved = match configured {
            Some(path) => Some(path),
            None => {
                if let Some(path) = &config.ffmpeg_path {
                    warn!(path = %path, "Configured ffmpeg path does not exist, searching PATH");
                }
                which::which("ffmpeg").ok()
            }
        };

        let program = match resolved {
            Some(path) if Self::probe(&path).await => {
                info!(path = %path.display(), "Using ffmpeg encoder");
                Some(path)
            }
            Some(path) => {
                warn!(path = %path.display(), "ffmpeg found but not runnable, renditions will be placeholders");
                None
            }
            None => {
                warn!("ffmpeg not found, renditions will be placeholders");
                None
            }
        };

        Self {
            program,
            timeout: config.encode_timeout(),
        }
    }

    /// Encoder that never runs anything
    #[must_use]
    pub const fn unavailable() -> Self {
        Self {
            program: None,
            timeout: Duration::from_secs(0),
        }
    }

    /// Run `{program} -version` and report whether it exited successfully
    pub async fn probe(program: &Path) -> bool {
        let mut cmd = Command::new(program);
        cmd.arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(error = %e, program = %program.display(), "ffmpeg probe failed to start");
                false
            }
            Err(_) => false,
        }
    }

    /// Command line for one rendition
    #[must_use]
    pub fn arguments(source: &Path, rendition: &Rendition, output_dir: &Path) -> Vec<String> {
        let segment_pattern = output_dir.join("seg_%03d.ts");
        let playlist = output_dir.join(PLAYLIST_FILE);

        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(source.to_string_lossy().into_owned());
        args.push("-vf".to_string());
        args.push(format!("scale=-2:{}", rendition.height));
        args.extend(
            [
                "-c:v", "libx264", "-preset", "veryfast", "-crf", "23",
                "-c:a", "aac", "-b:a", "128k", "-ac", "2",
                "-f", "hls", "-hls_playlist_type", "vod",
            ]
            .into_iter()
            .map(String::from),
        );
        args.push("-hls_time".to_string());
        args.push(SEGMENT_SECONDS.to_string());
        args.push("-hls_segment_filename".to_string());
        args.push(segment_pattern.to_string_lossy().into_owned());
        args.push(playlist.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    async fn encode(&self, source: &Path, rendition: &Rendition, output_dir: &Path) -> Result<(), StepError> {
        let execution_error = |message: String| StepError::EncoderExecution {
            rendition: rendition.label.to_string(),
            message,
        };

        let Some(program) = &self.program else {
            return Err(StepError::EncoderUnavailable("ffmpeg not found".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(Self::arguments(source, rendition, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // a timed-out encode is killed when the future is dropped
            .kill_on_drop(true);

        debug!(rendition = rendition.label, source = %source.display(), "Starting ffmpeg");
        let child = cmd
            .spawn()
            .map_err(|e| execution_error(format!("failed to spawn: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(execution_error(format!("I/O error waiting for process: {e}"))),
            Err(_) => return Err(execution_error(format!("timed out after {:?}", self.timeout))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(execution_error(format!(
                "exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !output_dir.join(PLAYLIST_FILE).exists() {
            return Err(execution_error("no playlist produced".to_string()));
        }

        debug!(rendition = rendition.label, "ffmpeg finished");
        Ok(())
    }
}

/// Write a fixed stand-in rendition: [`PLACEHOLDER_SEGMENTS`] small text
/// segments and a VOD playlist that lists them.
pub async fn write_placeholder(source_key: &str, rendition: &Rendition, output_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(output_dir).await?;
    for index in 0..PLACEHOLDER_SEGMENTS {
        let content = format!(
            "Simulated segment {index} of {} from {source_key}\n",
            rendition.label
        );
        tokio::fs::write(output_dir.join(segment_name(index)), content).await?;
    }
    tokio::fs::write(output_dir.join(PLAYLIST_FILE), vod_playlist(PLACEHOLDER_SEGMENTS)).await?;
    Ok(())
}
