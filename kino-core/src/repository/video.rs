use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use super::StatusStore;
use crate::{
    models::{Video, VideoId, VideoStatus},
    Error, Result,
};

/// Video repository for database operations
#[derive(Clone)]
pub struct VideoRepository {
    pool: PgPool,
}

impl VideoRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get video by ID
    pub async fn get_by_id(&self, id: VideoId) -> Result<Option<Video>> {
        let row = sqlx::query(
            "SELECT id, source_key, status, master_url, created_at
             FROM videos
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_video(&row)).transpose()
    }

    /// Insert the record, or update status and master URL of an existing one
    pub async fn upsert(&self, video: &Video) -> Result<()> {
        sqlx::query(
            "INSERT INTO videos (id, source_key, status, master_url, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, master_url = EXCLUDED.master_url",
        )
        .bind(video.id.as_i64())
        .bind(&video.source_key)
        .bind(video.status().as_str())
        .bind(video.master_url())
        .bind(video.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_video(row: &PgRow) -> Result<Video> {
        let status: String = row.try_get("status")?;
        let status: VideoStatus = status.parse().map_err(|e: Error| {
            tracing::warn!(error = %e, "Unknown video status in database");
            e
        })?;

        Video::from_parts(
            VideoId(row.try_get("id")?),
            row.try_get("source_key")?,
            status,
            row.try_get("master_url")?,
            row.try_get("created_at")?,
        )
    }
}

#[async_trait]
impl StatusStore for VideoRepository {
    async fn load(&self, id: VideoId) -> Result<Video> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("video {id}")))
    }

    async fn save(&self, video: &Video) -> Result<()> {
        self.upsert(video).await
    }
}
