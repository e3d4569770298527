use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Maximum simultaneous connections in one room
    pub max_connections_per_room: usize,
    /// Maximum simultaneous connections on this node
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            max_connections_per_room: 200,
            max_connections: 10_000,
        }
    }
}

/// Relational status store. An empty URL selects the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            connect_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "kino:".to_string(),
        }
    }
}

/// Broadcast bus backend, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    /// In-process delivery only
    #[default]
    Local,
    /// Redis Pub/Sub, reaches listeners in every process
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Room channels are named `{room_channel_prefix}:{room_code}`
    pub room_channel_prefix: String,
    /// Global channel carrying video status events
    pub status_channel: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Local,
            room_channel_prefix: "room".to_string(),
            status_channel: "video_status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

/// Object storage settings (S3, Minio or any S3-compatible service)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    /// When set, object URLs are `{public_url_prefix}/{key}` instead of presigned
    pub public_url_prefix: Option<String>,
    pub presign_ttl_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "http://localhost:9000".to_string(),
            bucket: "kino-videos".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin123".to_string(),
            region: "us-east-1".to_string(),
            public_url_prefix: None,
            presign_ttl_seconds: 3600,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue: QueueBackend,
    /// Jobs processed at the same time by one worker process
    pub concurrency: usize,
    /// Explicit encoder binary, otherwise `ffmpeg` is looked up on `PATH`
    pub ffmpeg_path: Option<String>,
    pub encode_timeout_seconds: u64,
    /// Parent directory for per-job scratch space (system temp dir if unset)
    pub scratch_dir: Option<String>,
    /// Sleep between polls of an empty job queue
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: QueueBackend::Redis,
            concurrency: 2,
            ffmpeg_path: None,
            encode_timeout_seconds: 3600,
            scratch_dir: None,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_seconds)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // KINO_STORAGE__BUCKET, KINO_BUS__BACKEND, ...
        builder = builder.add_source(
            Environment::with_prefix("KINO")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Name of the bus channel for a room code
    #[must_use]
    pub fn room_channel(&self, room_code: &str) -> String {
        crate::models::channel_for_code(&self.bus.room_channel_prefix, room_code)
    }

    /// Check cross-field consistency, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bus.backend == BusBackend::Redis && self.redis.url.is_empty() {
            errors.push("bus.backend = redis requires redis.url".to_string());
        }
        if self.worker.queue == QueueBackend::Redis && self.redis.url.is_empty() {
            errors.push("worker.queue = redis requires redis.url".to_string());
        }
        if self.bus.status_channel.is_empty() {
            errors.push("bus.status_channel must not be empty".to_string());
        }
        if self.bus.status_channel.starts_with(&format!("{}:", self.bus.room_channel_prefix)) {
            errors.push("bus.status_channel must not collide with room channels".to_string());
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_empty() {
            errors.push("storage.bucket must be set for the s3 backend".to_string());
        }
        if self.storage.presign_ttl_seconds == 0 {
            errors.push("storage.presign_ttl_seconds must be positive".to_string());
        }
        if self.worker.concurrency == 0 {
            errors.push("worker.concurrency must be at least 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format '{}' is not json or pretty", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
