//! Transcode worker
//!
//! One job run:
//! 1. mark the video `processing`, save, publish
//! 2. fetch the source into a private scratch directory
//! 3. produce every rendition (ffmpeg or placeholder), upload segments and a
//!    variant playlist pointing at presigned segment URLs
//! 4. upload the master playlist, mark the video `ready`, save, publish
//!
//! Any run that ends without a master URL is forced to `failed`.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kino_cluster::BroadcastBus;
use kino_core::models::{StatusEvent, TranscodeJob, Video, VideoId, VideoStatus};
use kino_core::queue::JobBroker;
use kino_core::repository::StatusStore;
use kino_core::storage::{BlobStore, PLAYLIST_CONTENT_TYPE, SEGMENT_CONTENT_TYPE};
use kino_core::Config;

use crate::encoder::{write_placeholder, Encoder};
use crate::error::StepError;
use crate::playlist::{master_playlist, rewrite_segment_uris, segment_uris};
use crate::rendition::{master_key, output_stem, playlist_key, rendition_prefix, Rendition, PLAYLIST_FILE, RENDITIONS};

/// Worker tuning taken from configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs handled at the same time by [`TranscodeWorker::run`]
    pub concurrency: usize,
    pub presign_ttl: Duration,
    /// Parent of per-job scratch directories (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    /// Bus channel receiving status events
    pub status_channel: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            presign_ttl: Duration::from_secs(3600),
            scratch_dir: None,
            status_channel: "video_status".to_string(),
        }
    }
}

impl WorkerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker.concurrency.max(1),
            presign_ttl: config.storage.presign_ttl(),
            scratch_dir: config.worker.scratch_dir.as_ref().map(PathBuf::from),
            status_channel: config.bus.status_channel.clone(),
        }
    }
}

/// How a rendition was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionOutcome {
    Encoded,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionReport {
    pub label: &'static str,
    pub outcome: RenditionOutcome,
    pub playlist_url: String,
}

/// What happened during one job run
#[derive(Debug, Clone)]
pub struct JobReport {
    pub storage_key: String,
    pub video_id: Option<VideoId>,
    /// Final status of the run; also reported for jobs without a video record
    pub status: VideoStatus,
    pub master_url: Option<String>,
    pub renditions: Vec<RenditionReport>,
    pub errors: Vec<StepError>,
}

impl JobReport {
    fn new(job: &TranscodeJob) -> Self {
        Self {
            storage_key: job.storage_key.clone(),
            video_id: job.video_id,
            status: VideoStatus::Processing,
            master_url: None,
            renditions: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == VideoStatus::Ready
    }
}

/// Consumes transcode jobs and drives the video status state machine
#[derive(Clone)]
pub struct TranscodeWorker {
    blobs: Arc<dyn BlobStore>,
    statuses: Arc<dyn StatusStore>,
    bus: BroadcastBus,
    encoder: Arc<dyn Encoder>,
    settings: WorkerSettings,
}

impl TranscodeWorker {
    #[must_use]
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        statuses: Arc<dyn StatusStore>,
        bus: BroadcastBus,
        encoder: Arc<dyn Encoder>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            blobs,
            statuses,
            bus,
            encoder,
            settings,
        }
    }

    /// Consume jobs until `cancel` fires, handling up to `concurrency` at once.
    /// Each delivery is acknowledged after its run, whatever the outcome.
    pub async fn run(&self, broker: &dyn JobBroker, cancel: CancellationToken) {
        info!(concurrency = self.settings.concurrency, "Transcode worker started");

        broker
            .consume(cancel)
            .for_each_concurrent(self.settings.concurrency, |delivery| async move {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(error = %e, "Failed to receive job");
                        return;
                    }
                };

                let report = self.handle(&delivery.job).await;
                info!(
                    storage_key = %report.storage_key,
                    status = %report.status,
                    errors = report.errors.len(),
                    "Job finished"
                );

                if let Err(e) = broker.ack(&delivery).await {
                    warn!(error = %e, storage_key = %delivery.job.storage_key, "Failed to acknowledge job");
                }
            })
            .await;

        info!("Transcode worker stopped");
    }

    /// Handle one job. Never fails: every problem ends up in the report and,
    /// when fatal, in a `failed` status.
    pub async fn handle(&self, job: &TranscodeJob) -> JobReport {
        let mut report = JobReport::new(job);
        info!(storage_key = %job.storage_key, video_id = ?job.video_id, simulate = job.simulate, "Handling transcode job");

        let mut video = self.begin(job, &mut report).await;

        match self.transcode(job, &mut report).await {
            Ok(master_url) => self.finish_ready(video.as_mut(), master_url, &mut report).await,
            Err(e) => {
                error!(error = %e, storage_key = %job.storage_key, "Transcode failed");
                report.errors.push(e);
            }
        }

        // Safety net: a run without a master URL is a failed run
        if report.master_url.is_none() {
            self.finish_failed(video.as_mut(), &mut report).await;
        }

        report
    }

    async fn begin(&self, job: &TranscodeJob, report: &mut JobReport) -> Option<Video> {
        let Some(id) = job.video_id else {
            debug!(storage_key = %job.storage_key, "Job has no video id, status tracking skipped");
            return None;
        };

        let mut video = match self.statuses.load(id).await {
            Ok(video) => video,
            Err(e) if e.is_not_found() => {
                warn!(video_id = %id, "Video record missing, creating it");
                Video::new(id, job.storage_key.clone())
            }
            Err(e) => {
                warn!(error = %e, video_id = %id, "Failed to load video record");
                report.errors.push(StepError::Persistence(e.to_string()));
                Video::new(id, job.storage_key.clone())
            }
        };

        video.start_processing();
        self.save(&video, report).await;
        self.publish(&video, report).await;
        Some(video)
    }

    async fn finish_ready(&self, video: Option<&mut Video>, master_url: String, report: &mut JobReport) {
        if let Some(video) = video {
            if let Err(e) = video.mark_ready(master_url.clone()) {
                report.errors.push(StepError::Persistence(e.to_string()));
                return;
            }
            report.status = VideoStatus::Ready;
            report.master_url = Some(master_url);
            self.save(video, report).await;
            self.publish(video, report).await;
        } else {
            report.status = VideoStatus::Ready;
            report.master_url = Some(master_url);
        }
        info!(storage_key = %report.storage_key, "Video ready");
    }

    async fn finish_failed(&self, video: Option<&mut Video>, report: &mut JobReport) {
        report.status = VideoStatus::Failed;
        if let Some(video) = video {
            if let Err(e) = video.mark_failed() {
                report.errors.push(StepError::Persistence(e.to_string()));
                return;
            }
            self.save(video, report).await;
            self.publish(video, report).await;
        }
        warn!(storage_key = %report.storage_key, "Video failed");
    }

    async fn save(&self, video: &Video, report: &mut JobReport) {
        if let Err(e) = self.statuses.save(video).await {
            warn!(error = %e, video_id = %video.id, status = %video.status(), "Failed to save video status");
            report.errors.push(StepError::Persistence(e.to_string()));
        }
    }

    async fn publish(&self, video: &Video, report: &mut JobReport) {
        let event = StatusEvent::for_video(video);
        match self.bus.publish_json(&self.settings.status_channel, &event).await {
            Ok(receivers) => {
                debug!(video_id = %video.id, status = %video.status(), receivers, "Status event published");
            }
            Err(e) => {
                warn!(error = %e, video_id = %video.id, "Failed to publish status event");
                report.errors.push(StepError::Publish(e.to_string()));
            }
        }
    }

    fn scratch(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kino-job-");
        match &self.settings.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }

    /// Steps 2 to 4. Returns the presigned master URL.
    async fn transcode(&self, job: &TranscodeJob, report: &mut JobReport) -> Result<String, StepError> {
        // removed on drop, on every exit path
        let scratch = self.scratch().map_err(|e| StepError::fetch(&job.storage_key, e))?;

        let source = self.fetch_source(&job.storage_key, scratch.path()).await?;
        let stem = output_stem(&job.storage_key);

        let encoder_ready = self.encoder.is_available();
        if !job.simulate && !encoder_ready {
            report
                .errors
                .push(StepError::EncoderUnavailable("no usable ffmpeg binary".to_string()));
        }
        let use_placeholder = job.simulate || !encoder_ready;

        for rendition in &RENDITIONS {
            let output_dir = scratch.path().join(rendition.label);
            let outcome = self
                .produce(job, &source, rendition, &output_dir, use_placeholder, report)
                .await?;
            let playlist_url = self.upload_rendition(&stem, rendition, &output_dir).await?;
            report.renditions.push(RenditionReport {
                label: rendition.label,
                outcome,
                playlist_url,
            });
        }

        let master = master_playlist(report.renditions.iter().map(|r| r.playlist_url.as_str()));
        let key = master_key(&stem);
        self.blobs
            .put(&key, Bytes::from(master), PLAYLIST_CONTENT_TYPE)
            .await
            .map_err(|e| StepError::storage(&key, e))?;
        self.blobs
            .presigned_url(&key, self.settings.presign_ttl)
            .await
            .map_err(|e| StepError::storage(&key, e))
    }

    async fn fetch_source(&self, key: &str, scratch: &Path) -> Result<PathBuf, StepError> {
        let data = self.blobs.get(key).await.map_err(|e| StepError::fetch(key, e))?;

        let file_name = Path::new(key)
            .file_name()
            .map_or_else(|| "source".into(), |n| n.to_os_string());
        let path = scratch.join(file_name);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| StepError::fetch(key, e))?;

        debug!(key = %key, size = data.len(), "Fetched source");
        Ok(path)
    }

    async fn produce(
        &self,
        job: &TranscodeJob,
        source: &Path,
        rendition: &Rendition,
        output_dir: &Path,
        use_placeholder: bool,
        report: &mut JobReport,
    ) -> Result<RenditionOutcome, StepError> {
        let placeholder = |dir: &Path| {
            let dir = dir.to_path_buf();
            let key = job.storage_key.clone();
            async move {
                write_placeholder(&key, rendition, &dir)
                    .await
                    .map_err(|e| StepError::storage(&dir.to_string_lossy(), e))
            }
        };

        if use_placeholder {
            placeholder(output_dir).await?;
            return Ok(RenditionOutcome::Placeholder);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| StepError::storage(&output_dir.to_string_lossy(), e))?;

        match self.encoder.encode(source, rendition, output_dir).await {
            Ok(()) => Ok(RenditionOutcome::Encoded),
            Err(e) => {
                warn!(error = %e, rendition = rendition.label, "Encoding failed, using placeholder");
                report.errors.push(e);
                // drop partial output before writing the stand-in
                if let Err(e) = tokio::fs::remove_dir_all(output_dir).await {
                    debug!(error = %e, "Failed to clear partial rendition output");
                }
                placeholder(output_dir).await?;
                Ok(RenditionOutcome::Placeholder)
            }
        }
    }

    /// Replace everything under the rendition prefix with the files in
    /// `output_dir`. Returns the presigned variant playlist URL.
    async fn upload_rendition(&self, stem: &str, rendition: &Rendition, output_dir: &Path) -> Result<String, StepError> {
        let prefix = rendition_prefix(stem, rendition.label);

        let stale = self
            .blobs
            .list(&prefix)
            .await
            .map_err(|e| StepError::storage(&prefix, e))?;
        if !stale.is_empty() {
            debug!(prefix = %prefix, count = stale.len(), "Removing stale rendition objects");
            self.blobs
                .delete(&stale)
                .await
                .map_err(|e| StepError::storage(&prefix, e))?;
        }

        let playlist_path = output_dir.join(PLAYLIST_FILE);
        let playlist = tokio::fs::read_to_string(&playlist_path)
            .await
            .map_err(|e| StepError::storage(&playlist_path.to_string_lossy(), e))?;

        let mut segment_urls = HashMap::new();
        for uri in segment_uris(&playlist) {
            let local = output_dir.join(uri);
            let data = tokio::fs::read(&local)
                .await
                .map_err(|e| StepError::storage(&local.to_string_lossy(), e))?;

            let key = format!("{prefix}{uri}");
            self.blobs
                .put(&key, Bytes::from(data), SEGMENT_CONTENT_TYPE)
                .await
                .map_err(|e| StepError::storage(&key, e))?;
            let url = self
                .blobs
                .presigned_url(&key, self.settings.presign_ttl)
                .await
                .map_err(|e| StepError::storage(&key, e))?;
            segment_urls.insert(uri.to_string(), url);
        }

        let rewritten = rewrite_segment_uris(&playlist, |uri| segment_urls.get(uri).cloned());
        let key = playlist_key(stem, rendition.label);
        self.blobs
            .put(&key, Bytes::from(rewritten), PLAYLIST_CONTENT_TYPE)
            .await
            .map_err(|e| StepError::storage(&key, e))?;

        debug!(rendition = rendition.label, segments = segment_urls.len(), "Rendition uploaded");
        self.blobs
            .presigned_url(&key, self.settings.presign_ttl)
            .await
            .map_err(|e| StepError::storage(&key, e))
    }
}
