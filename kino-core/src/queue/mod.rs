//! Transcode job delivery

mod memory;
mod redis_queue;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::models::TranscodeJob;
use crate::Result;

pub use memory::MemoryJobBroker;
pub use redis_queue::RedisJobBroker;

/// A job handed to a consumer, to be acknowledged once handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: TranscodeJob,
    /// Backend-specific handle used by [`JobBroker::ack`]
    pub receipt: String,
}

/// At-least-once job broker contract.
///
/// A delivery that is never acknowledged may be handed out again, so job
/// handlers must be idempotent.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn enqueue(&self, job: &TranscodeJob) -> Result<()>;

    /// Stream of deliveries that ends once `cancel` fires
    fn consume(&self, cancel: CancellationToken) -> BoxStream<'static, Result<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}
