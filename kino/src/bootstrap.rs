//! Process-scoped dependencies
//!
//! Every collaborator (bus, blob store, status store, job broker) is built
//! once here and handed to the server and the worker explicitly.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use kino_cluster::{BroadcastBus, RoomConnectionManager};
use kino_core::config::QueueBackend;
use kino_core::queue::{JobBroker, MemoryJobBroker, RedisJobBroker};
use kino_core::repository::{MemoryStatusStore, StatusStore, VideoRepository};
use kino_core::storage::{BlobStore, OpendalBlobStore};
use kino_core::Config;
use kino_transcode::{FfmpegEncoder, TranscodeWorker, WorkerSettings};

/// Load configuration
///
/// Config file search order:
/// 1. `--config` / `KINO_CONFIG_PATH`
/// 2. ./config.yaml (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit.map(str::to_string).or_else(|| {
        let cwd = "config.yaml";
        Path::new(cwd).exists().then(|| cwd.to_string())
    });

    let config = match &config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(path).with_context(|| format!("Failed to load {path}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env().context("Failed to load config from environment")?
        }
    };

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Generate a unique node ID for this process
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

/// Connect to Postgres and apply migrations
async fn init_database(config: &Config) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&config.database.url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection failed: {e}")
        })?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        anyhow::anyhow!("Migration failed: {e}")
    })?;
    info!("Migrations completed");

    Ok(pool)
}

/// Shared dependencies of one process
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub node_id: String,
    pub bus: BroadcastBus,
    pub blobs: Arc<dyn BlobStore>,
    pub statuses: Arc<dyn StatusStore>,
    /// In-process queue shared by every producer and consumer of this process
    local_jobs: MemoryJobBroker,
    pool: Option<PgPool>,
}

impl AppContext {
    pub async fn init(config: Config, node_id: String) -> Result<Self> {
        // 1. Broadcast bus
        let bus = BroadcastBus::from_config(&config)
            .await
            .context("Failed to initialize broadcast bus")?;
        info!(backend = bus.backend_name(), "Broadcast bus initialized");

        // 2. Blob store
        let blobs: Arc<dyn BlobStore> = Arc::new(
            OpendalBlobStore::from_config(&config.storage).context("Failed to initialize blob store")?,
        );

        // 3. Status store
        let (statuses, pool): (Arc<dyn StatusStore>, Option<PgPool>) = if config.database.url.is_empty() {
            warn!("Database not configured, video statuses are kept in memory");
            (Arc::new(MemoryStatusStore::new()), None)
        } else {
            let pool = init_database(&config).await?;
            (Arc::new(VideoRepository::new(pool.clone())), Some(pool))
        };

        Ok(Self {
            config: Arc::new(config),
            node_id,
            bus,
            blobs,
            statuses,
            local_jobs: MemoryJobBroker::new(),
            pool,
        })
    }

    /// Job broker selected by `worker.queue`. Consumers requeue jobs left
    /// in flight by a crashed worker before they start.
    pub async fn job_broker(&self, consumer: bool) -> Result<Arc<dyn JobBroker>> {
        match self.config.worker.queue {
            QueueBackend::Redis => {
                let broker = RedisJobBroker::connect(
                    &self.config.redis.url,
                    &self.config.redis.key_prefix,
                    self.config.worker.poll_interval(),
                )
                .await
                .context("Failed to connect job broker")?;
                if consumer {
                    if let Err(e) = broker.recover().await {
                        warn!(error = %e, "Failed to requeue in-flight jobs");
                    }
                }
                Ok(Arc::new(broker))
            }
            QueueBackend::Memory => {
                warn!("Using in-memory job queue, jobs are only visible to this process");
                Ok(Arc::new(self.local_jobs.clone()))
            }
        }
    }

    /// Transcode worker with encoder discovery
    pub async fn transcode_worker(&self) -> TranscodeWorker {
        let encoder = FfmpegEncoder::detect(&self.config.worker).await;
        TranscodeWorker::new(
            self.blobs.clone(),
            self.statuses.clone(),
            self.bus.clone(),
            Arc::new(encoder),
            WorkerSettings::from_config(&self.config),
        )
    }

    #[must_use]
    pub fn connection_manager(&self) -> RoomConnectionManager {
        RoomConnectionManager::from_config(self.bus.clone(), &self.config)
    }

    /// Release background tasks and connections
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        if let Some(pool) = &self.pool {
            info!("Closing database connection pool...");
            pool.close().await;
        }
    }
}
