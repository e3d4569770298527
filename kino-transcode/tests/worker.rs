//! Job runs against in-memory collaborators
//!
//! Run with: cargo test -p kino-transcode --test worker

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kino_cluster::{BroadcastBackend, BroadcastBus, Listener, LocalBus};
use kino_core::models::{TranscodeJob, Video, VideoId, VideoStatus};
use kino_core::queue::{JobBroker, MemoryJobBroker};
use kino_core::repository::{MemoryStatusStore, StatusStore};
use kino_core::storage::{BlobStore, OpendalBlobStore};
use kino_transcode::playlist::vod_playlist;
use kino_transcode::{
    Encoder, FfmpegEncoder, Rendition, RenditionOutcome, StepError, TranscodeWorker, WorkerSettings,
};

mock! {
    pub Statuses {}

    #[async_trait]
    impl StatusStore for Statuses {
        async fn load(&self, id: VideoId) -> kino_core::Result<Video>;
        async fn save(&self, video: &Video) -> kino_core::Result<()>;
    }
}

/// Encoder that succeeds with two segments except for one rendition
struct FlakyEncoder {
    fail_label: &'static str,
}

#[async_trait]
impl Encoder for FlakyEncoder {
    fn is_available(&self) -> bool {
        true
    }

    async fn encode(&self, _source: &Path, rendition: &Rendition, output_dir: &Path) -> Result<(), StepError> {
        if rendition.label == self.fail_label {
            // leave partial output behind like a crashed encoder would
            tokio::fs::write(output_dir.join("seg_000.ts"), "partial").await.unwrap();
            return Err(StepError::EncoderExecution {
                rendition: rendition.label.to_string(),
                message: "exited with status 1".to_string(),
            });
        }
        for index in 0..2 {
            tokio::fs::write(output_dir.join(format!("seg_{index:03}.ts")), "encoded").await.unwrap();
        }
        tokio::fs::write(output_dir.join("playlist.m3u8"), vod_playlist(2)).await.unwrap();
        Ok(())
    }
}

/// Encoder that replaces its output directory with a plain file, so the
/// placeholder stand-in cannot be written either
struct ClobberingEncoder;

#[async_trait]
impl Encoder for ClobberingEncoder {
    fn is_available(&self) -> bool {
        true
    }

    async fn encode(&self, _source: &Path, rendition: &Rendition, output_dir: &Path) -> Result<(), StepError> {
        tokio::fs::remove_dir_all(output_dir).await.unwrap();
        tokio::fs::write(output_dir, "not a directory").await.unwrap();
        Err(StepError::EncoderExecution {
            rendition: rendition.label.to_string(),
            message: "killed".to_string(),
        })
    }
}

/// Blob store that refuses writes to keys ending with `rejected_suffix`
struct RejectingBlobs {
    inner: OpendalBlobStore,
    rejected_suffix: &'static str,
}

#[async_trait]
impl BlobStore for RejectingBlobs {
    async fn get(&self, key: &str) -> kino_core::Result<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> kino_core::Result<()> {
        if key.ends_with(self.rejected_suffix) {
            return Err(kino_core::Error::Internal("access denied".to_string()));
        }
        self.inner.put(key, data, content_type).await
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> kino_core::Result<String> {
        self.inner.presigned_url(key, ttl).await
    }

    async fn list(&self, prefix: &str) -> kino_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, keys: &[String]) -> kino_core::Result<()> {
        self.inner.delete(keys).await
    }
}

struct Harness {
    worker: TranscodeWorker,
    blobs: Arc<OpendalBlobStore>,
    events: mpsc::UnboundedReceiver<String>,
}

async fn harness(statuses: Arc<dyn StatusStore>, encoder: Arc<dyn Encoder>) -> Harness {
    let blobs = Arc::new(OpendalBlobStore::memory("http://blobs.test").unwrap());
    blobs
        .put("videos/a.mp4", Bytes::from_static(b"fake mp4"), "video/mp4")
        .await
        .unwrap();

    let bus = BroadcastBus::Local(LocalBus::new());
    let (listener, events) = Listener::new("test-observer");
    bus.connect("video_status", listener).await.unwrap();

    let worker = TranscodeWorker::new(blobs.clone(), statuses, bus, encoder, WorkerSettings::default());
    Harness { worker, blobs, events }
}

fn seeded_store(id: i64) -> Arc<MemoryStatusStore> {
    let store = Arc::new(MemoryStatusStore::new());
    store.insert(Video::new(VideoId(id), "videos/a.mp4"));
    store
}

fn drain(events: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_simulated_job_becomes_ready() {
    let store = seeded_store(7);
    let mut h = harness(store.clone(), Arc::new(FfmpegEncoder::unavailable())).await;

    let job = TranscodeJob::new("videos/a.mp4", Some(VideoId(7))).simulated();
    let report = h.worker.handle(&job).await;

    assert!(report.is_ready());
    assert_eq!(report.master_url.as_deref(), Some("http://blobs.test/hls/a/master.m3u8"));
    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
    assert!(report
        .renditions
        .iter()
        .all(|r| r.outcome == RenditionOutcome::Placeholder));

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], r#"{"kind":"video_status","id":7,"status":"processing"}"#);
    let ready: Value = serde_json::from_str(&events[1]).unwrap();
    assert_eq!(ready["kind"], "video_status");
    assert_eq!(ready["id"], 7);
    assert_eq!(ready["status"], "ready");
    assert!(ready["masterUrl"].as_str().unwrap().ends_with("/master.m3u8"));

    let video = store.get(VideoId(7)).unwrap();
    assert_eq!(video.status(), VideoStatus::Ready);
    assert_eq!(video.master_url(), report.master_url.as_deref());
    assert_eq!(store.history(VideoId(7)), vec![VideoStatus::Processing, VideoStatus::Ready]);
}

#[tokio::test]
async fn test_master_and_variant_playlists() {
    let store = seeded_store(7);
    let h = harness(store, Arc::new(FfmpegEncoder::unavailable())).await;
    h.worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))).simulated())
        .await;

    let master = h.blobs.get("hls/a/master.m3u8").await.unwrap();
    let master = String::from_utf8(master.to_vec()).unwrap();
    let lines: Vec<&str> = master.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(
        lines[2..],
        [
            "#EXT-X-STREAM-INF:BANDWIDTH=800000",
            "http://blobs.test/hls/a/1080p/playlist.m3u8",
            "#EXT-X-STREAM-INF:BANDWIDTH=800000",
            "http://blobs.test/hls/a/720p/playlist.m3u8",
            "#EXT-X-STREAM-INF:BANDWIDTH=800000",
            "http://blobs.test/hls/a/480p/playlist.m3u8",
        ]
    );

    let variant = h.blobs.get("hls/a/720p/playlist.m3u8").await.unwrap();
    let variant = String::from_utf8(variant.to_vec()).unwrap();
    assert!(variant.contains("\nhttp://blobs.test/hls/a/720p/seg_000.ts\n"));
    assert!(variant.contains("\nhttp://blobs.test/hls/a/720p/seg_002.ts\n"));
    assert!(!variant.contains("\nseg_000.ts\n"));

    let segment = h.blobs.get("hls/a/720p/seg_001.ts").await.unwrap();
    assert_eq!(segment, Bytes::from_static(b"Simulated segment 1 of 720p from videos/a.mp4\n"));
}

#[tokio::test]
async fn test_missing_source_fails() {
    let store = seeded_store(8);
    let mut h = harness(store.clone(), Arc::new(FfmpegEncoder::unavailable())).await;

    let job = TranscodeJob::new("videos/missing.mp4", Some(VideoId(8))).simulated();
    let report = h.worker.handle(&job).await;

    assert_eq!(report.status, VideoStatus::Failed);
    assert!(report.master_url.is_none());
    assert!(matches!(report.errors[..], [StepError::TransientInfra { .. }]));

    let events = drain(&mut h.events);
    assert_eq!(
        events,
        vec![
            r#"{"kind":"video_status","id":8,"status":"processing"}"#.to_string(),
            r#"{"kind":"video_status","id":8,"status":"failed"}"#.to_string(),
        ]
    );

    let video = store.get(VideoId(8)).unwrap();
    assert_eq!(video.status(), VideoStatus::Failed);
    assert!(video.master_url().is_none());
    assert!(h.blobs.list("hls/missing/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_encoder_unavailable_degrades_to_placeholders() {
    let store = seeded_store(7);
    let h = harness(store, Arc::new(FfmpegEncoder::unavailable())).await;

    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))))
        .await;

    assert!(report.is_ready());
    assert!(matches!(report.errors[..], [StepError::EncoderUnavailable(_)]));
    assert_eq!(report.renditions.len(), 3);
}

#[tokio::test]
async fn test_failed_rendition_is_replaced() {
    let store = seeded_store(7);
    let h = harness(store, Arc::new(FlakyEncoder { fail_label: "720p" })).await;

    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))))
        .await;

    assert!(report.is_ready());
    let outcomes: Vec<_> = report.renditions.iter().map(|r| (r.label, r.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            ("1080p", RenditionOutcome::Encoded),
            ("720p", RenditionOutcome::Placeholder),
            ("480p", RenditionOutcome::Encoded),
        ]
    );
    assert!(matches!(
        report.errors[..],
        [StepError::EncoderExecution { ref rendition, .. }] if rendition == "720p"
    ));

    assert_eq!(h.blobs.list("hls/a/1080p/").await.unwrap().len(), 3);
    // placeholder replaced the partial segment
    assert_eq!(h.blobs.list("hls/a/720p/").await.unwrap().len(), 4);
    let segment = h.blobs.get("hls/a/720p/seg_000.ts").await.unwrap();
    assert_ne!(segment, Bytes::from_static(b"partial"));
}

#[tokio::test]
async fn test_rerun_clears_stale_objects() {
    let store = seeded_store(7);
    let h = harness(store.clone(), Arc::new(FfmpegEncoder::unavailable())).await;
    h.blobs
        .put("hls/a/1080p/seg_999.ts", Bytes::from_static(b"old"), "video/mp2t")
        .await
        .unwrap();

    let job = TranscodeJob::new("videos/a.mp4", Some(VideoId(7))).simulated();
    let first = h.worker.handle(&job).await;
    let second = h.worker.handle(&job).await;

    assert_eq!(first.master_url, second.master_url);
    assert_eq!(
        h.blobs.list("hls/a/1080p/").await.unwrap(),
        vec![
            "hls/a/1080p/playlist.m3u8".to_string(),
            "hls/a/1080p/seg_000.ts".to_string(),
            "hls/a/1080p/seg_001.ts".to_string(),
            "hls/a/1080p/seg_002.ts".to_string(),
        ]
    );
    assert_eq!(
        store.history(VideoId(7)),
        vec![
            VideoStatus::Processing,
            VideoStatus::Ready,
            VideoStatus::Processing,
            VideoStatus::Ready,
        ]
    );
}

#[tokio::test]
async fn test_missing_record_is_created() {
    let store = Arc::new(MemoryStatusStore::new());
    let h = harness(store.clone(), Arc::new(FfmpegEncoder::unavailable())).await;

    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(9))).simulated())
        .await;

    assert!(report.is_ready());
    let video = store.get(VideoId(9)).unwrap();
    assert_eq!(video.source_key, "videos/a.mp4");
    assert_eq!(video.status(), VideoStatus::Ready);
}

#[tokio::test]
async fn test_job_without_video_id() {
    let store = Arc::new(MemoryStatusStore::new());
    let mut h = harness(store, Arc::new(FfmpegEncoder::unavailable())).await;

    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", None).simulated())
        .await;

    assert!(report.is_ready());
    assert!(report.master_url.is_some());
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn test_persistence_failures_are_swallowed() {
    let mut statuses = MockStatuses::new();
    statuses
        .expect_load()
        .returning(|_| Err(kino_core::Error::Internal("connection refused".to_string())));
    statuses
        .expect_save()
        .times(2)
        .returning(|_| Err(kino_core::Error::Internal("connection refused".to_string())));

    let mut h = harness(Arc::new(statuses), Arc::new(FfmpegEncoder::unavailable())).await;
    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))).simulated())
        .await;

    assert!(report.is_ready());
    assert_eq!(report.errors.len(), 3);
    assert!(report.errors.iter().all(|e| matches!(e, StepError::Persistence(_))));

    // events still flow
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert!(events[1].contains(r#""status":"ready""#));
}

#[tokio::test]
async fn test_run_consumes_until_cancelled() {
    let store = Arc::new(MemoryStatusStore::new());
    let h = harness(store.clone(), Arc::new(FfmpegEncoder::unavailable())).await;
    let broker = MemoryJobBroker::new();
    broker
        .enqueue(&TranscodeJob::new("videos/a.mp4", Some(VideoId(1))).simulated())
        .await
        .unwrap();
    broker
        .enqueue(&TranscodeJob::new("videos/gone.mp4", Some(VideoId(2))).simulated())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let worker = h.worker.clone();
        let broker = broker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&broker, cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = [VideoId(1), VideoId(2)]
                .iter()
                .all(|id| store.get(*id).is_some_and(|v| v.status().is_terminal()));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    task.await.unwrap();

    assert_eq!(store.get(VideoId(1)).unwrap().status(), VideoStatus::Ready);
    assert_eq!(store.get(VideoId(2)).unwrap().status(), VideoStatus::Failed);
}

#[tokio::test]
async fn test_master_upload_failure_fails_the_run() {
    let inner = OpendalBlobStore::memory("http://blobs.test").unwrap();
    inner
        .put("videos/a.mp4", Bytes::from_static(b"fake mp4"), "video/mp4")
        .await
        .unwrap();
    let blobs = Arc::new(RejectingBlobs {
        inner,
        rejected_suffix: "master.m3u8",
    });

    let bus = BroadcastBus::Local(LocalBus::new());
    let (listener, mut events) = Listener::new("test-observer");
    bus.connect("video_status", listener).await.unwrap();

    let store = seeded_store(7);
    let worker = TranscodeWorker::new(
        blobs.clone(),
        store.clone(),
        bus,
        Arc::new(FfmpegEncoder::unavailable()),
        WorkerSettings::default(),
    );

    let report = worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))).simulated())
        .await;

    assert_eq!(report.status, VideoStatus::Failed);
    assert!(report.master_url.is_none());
    assert!(matches!(report.errors[..], [StepError::Storage(ref msg)] if msg.contains("hls/a/master.m3u8")));
    // variants were uploaded before the master was refused
    assert_eq!(report.renditions.len(), 3);

    assert_eq!(
        drain(&mut events),
        vec![
            r#"{"kind":"video_status","id":7,"status":"processing"}"#.to_string(),
            r#"{"kind":"video_status","id":7,"status":"failed"}"#.to_string(),
        ]
    );
    assert_eq!(store.get(VideoId(7)).unwrap().status(), VideoStatus::Failed);
}

#[tokio::test]
async fn test_unwritable_placeholder_is_a_storage_error() {
    let store = seeded_store(7);
    let mut h = harness(store.clone(), Arc::new(ClobberingEncoder)).await;

    let report = h
        .worker
        .handle(&TranscodeJob::new("videos/a.mp4", Some(VideoId(7))))
        .await;

    assert_eq!(report.status, VideoStatus::Failed);
    assert!(matches!(
        report.errors[..],
        [StepError::EncoderExecution { ref rendition, .. }, StepError::Storage(_)] if rendition == "1080p"
    ));
    // the source was fetched fine, so nothing is blamed on it
    assert!(!report
        .errors
        .iter()
        .any(|e| matches!(e, StepError::TransientInfra { .. })));

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert!(events[1].contains(r#""status":"failed""#));
    assert!(h.blobs.list("hls/a/").await.unwrap().is_empty());
}
