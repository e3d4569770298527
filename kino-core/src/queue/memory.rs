use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Delivery, JobBroker};
use crate::models::TranscodeJob;
use crate::Result;

/// In-process job queue for single-node deployments and tests.
///
/// Jobs live only as long as the process; acknowledgement is a no-op.
#[derive(Clone)]
pub struct MemoryJobBroker {
    tx: mpsc::UnboundedSender<TranscodeJob>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<TranscodeJob>>>,
}

impl MemoryJobBroker {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

impl Default for MemoryJobBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for MemoryJobBroker {
    async fn enqueue(&self, job: &TranscodeJob) -> Result<()> {
        self.tx
            .send(job.clone())
            .map_err(|_| crate::Error::Internal("job queue closed".to_string()))?;
        tracing::debug!(storage_key = %job.storage_key, "Job enqueued in memory");
        Ok(())
    }

    fn consume(&self, cancel: CancellationToken) -> BoxStream<'static, Result<Delivery>> {
        let rx = self.rx.clone();
        stream::unfold((rx, cancel), |(rx, cancel)| async move {
            let job = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => None,
                    job = guard.recv() => job,
                }
            }?;
            let delivery = Delivery {
                job,
                receipt: String::new(),
            };
            Some((Ok(delivery), (rx, cancel)))
        })
        .boxed()
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VideoId;

    #[tokio::test]
    async fn test_jobs_are_consumed_in_order() {
        let broker = MemoryJobBroker::new();
        broker.enqueue(&TranscodeJob::new("videos/a.mp4", Some(VideoId(1)))).await.unwrap();
        broker.enqueue(&TranscodeJob::new("videos/b.mp4", None)).await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = broker.consume(cancel.clone());

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.job.storage_key, "videos/a.mp4");
        assert_eq!(second.job.storage_key, "videos/b.mp4");
        broker.ack(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ends_on_cancel() {
        let broker = MemoryJobBroker::new();
        let cancel = CancellationToken::new();
        let mut stream = broker.consume(cancel.clone());

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
