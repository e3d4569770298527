mod bootstrap;
mod cli;
mod server;
mod websocket;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kino_core::config::QueueBackend;
use kino_core::logging;
use kino_core::models::{TranscodeJob, VideoId};

use bootstrap::{generate_node_id, load_config, AppContext};
use cli::{Cli, Commands};
use server::{shutdown_signal, KinoServer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!(node_id = %node_id, "Kino starting...");

    // 3. Initialize shared dependencies
    let ctx = AppContext::init(config, node_id).await?;

    match cli.command {
        Commands::Serve { with_worker } => {
            if !with_worker && ctx.config.worker.queue == QueueBackend::Memory {
                warn!("In-memory job queue without an embedded worker: submitted jobs are never consumed");
            }
            KinoServer::new(ctx, with_worker).start().await
        }
        Commands::Worker => run_worker(ctx).await,
        Commands::Enqueue {
            storage_key,
            video_id,
            simulate,
        } => {
            let mut job = TranscodeJob::new(storage_key, video_id.map(VideoId::new));
            job.simulate = simulate;
            enqueue(ctx, job).await
        }
    }
}

/// Consume jobs until Ctrl+C / SIGTERM, then finish in-flight jobs
async fn run_worker(ctx: AppContext) -> Result<()> {
    if ctx.config.worker.queue == QueueBackend::Memory {
        return Err(anyhow::anyhow!(
            "a standalone worker needs a shared queue; set worker.queue = redis or use serve --with-worker"
        ));
    }

    let broker = ctx.job_broker(true).await?;
    let worker = ctx.transcode_worker().await;
    let cancel = CancellationToken::new();

    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            worker.run(broker.as_ref(), cancel).await;
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received, waiting for in-flight jobs...");
    cancel.cancel();
    if let Err(e) = handle.await {
        error!("Worker task failed: {}", e);
    }

    ctx.shutdown().await;
    info!("Worker stopped");
    Ok(())
}

async fn enqueue(ctx: AppContext, job: TranscodeJob) -> Result<()> {
    if ctx.config.worker.queue == QueueBackend::Memory {
        return Err(anyhow::anyhow!(
            "enqueue needs a shared queue; set worker.queue = redis"
        ));
    }

    let broker = ctx.job_broker(false).await?;
    broker.enqueue(&job).await?;
    info!(storage_key = %job.storage_key, video_id = ?job.video_id, simulate = job.simulate, "Job enqueued");
    println!("{}", job.to_json()?);

    ctx.shutdown().await;
    Ok(())
}
