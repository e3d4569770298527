//! Server lifecycle management
//!
//! Manages the startup and shutdown of:
//! - the HTTP/WebSocket server
//! - an optional embedded transcode worker
//!
//! `POST /jobs` submits a transcode job to the configured queue, which is the
//! only way to feed an embedded worker running on the in-memory queue.

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use kino_cluster::RoomConnectionManager;
use kino_core::models::TranscodeJob;
use kino_core::queue::JobBroker;

use crate::bootstrap::AppContext;
use crate::websocket::{room_socket, status_socket};

/// State shared by every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub connections: RoomConnectionManager,
    pub jobs: Arc<dyn JobBroker>,
    pub node_id: Arc<str>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: String,
    pub bus: &'static str,
    pub connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.to_string(),
        bus: state.connections.bus().backend_name(),
        connections: state.connections.connection_count(),
    })
}

/// Queue a transcode job; the body is the job message JSON
async fn submit_job(
    State(state): State<AppState>,
    Json(job): Json<TranscodeJob>,
) -> Result<(StatusCode, Json<TranscodeJob>), (StatusCode, String)> {
    if job.storage_key.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "storageKey must not be empty".to_string()));
    }
    state.jobs.enqueue(&job).await.map_err(|e| {
        error!(error = %e, storage_key = %job.storage_key, "Failed to enqueue job");
        (StatusCode::SERVICE_UNAVAILABLE, "job queue unavailable".to_string())
    })?;
    info!(storage_key = %job.storage_key, video_id = ?job.video_id, "Job submitted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Build the HTTP router. `/ws/events` takes precedence over a room coded `events`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/ws/events", get(status_socket))
        .route("/ws/{room_code}", get(room_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Kino server - HTTP/WebSocket endpoints plus an optional embedded worker
pub struct KinoServer {
    ctx: AppContext,
    connections: RoomConnectionManager,
    with_worker: bool,
}

impl KinoServer {
    #[must_use]
    pub fn new(ctx: AppContext, with_worker: bool) -> Self {
        let connections = ctx.connection_manager();
        Self {
            ctx,
            connections,
            with_worker,
        }
    }

    /// Start all components and wait for a shutdown signal
    pub async fn start(self) -> Result<()> {
        info!(node_id = %self.ctx.node_id, "Starting Kino server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_cancel = CancellationToken::new();

        let http_handle = self.start_http_server(shutdown_rx).await?;
        let worker_handle = if self.with_worker {
            Some(self.start_worker(worker_cancel.clone()).await?)
        } else {
            None
        };

        info!("All servers started successfully");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        worker_cancel.cancel();
        if let Some(handle) = worker_handle {
            info!("Waiting for in-flight transcode jobs...");
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down Kino server...");

        // Wait for active connections to drain (with timeout)
        let drain_timeout = Duration::from_secs(10);
        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let remaining = self.connections.connection_count();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                    remaining
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        self.ctx.shutdown().await;
        info!("Kino server shut down complete");
    }

    async fn start_worker(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let broker = self.ctx.job_broker(true).await?;
        let worker = self.ctx.transcode_worker().await;
        info!("Embedded transcode worker enabled");

        Ok(tokio::spawn(async move {
            worker.run(broker.as_ref(), cancel).await;
        }))
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let http_address = self.ctx.config.http_address();
        let router = create_router(AppState {
            connections: self.connections.clone(),
            jobs: self.ctx.job_broker(false).await?,
            node_id: Arc::from(self.ctx.node_id.as_str()),
        });

        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
