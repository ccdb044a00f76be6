mod cli;

use clap::Parser;
use gcluster::config::{load_config, Config};
use gcluster::core::events::SchedulerEvent;
use gcluster::core::manager::ResourceManager;
use gcluster::core::runtime::SchedulerRuntime;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let gclusterd = cli::GClusterd::parse();
    let config = load_config(gclusterd.config.as_ref())?;
    let _guard = init_tracing(&gclusterd, &config)?;

    let cluster = Arc::new(config.cluster.build()?);
    if gclusterd.check {
        println!("{}", serde_json::to_string_pretty(&cluster.info())?);
        return Ok(());
    }
    tracing::info!(
        "Cluster {} ready with {} node(s): [{}]",
        cluster.id(),
        cluster.node_ids().len(),
        cluster.total_resource()
    );

    let scheduler = Arc::new(config.scheduler.builder().with_cluster(cluster).build());
    let event_logger = tokio::spawn(log_events(scheduler.subscribe()));

    let runtime = SchedulerRuntime::new(Arc::clone(&scheduler));
    if !runtime.start() {
        anyhow::bail!("Failed to start the scheduler loop");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down");
    runtime.stop().await;
    event_logger.abort();

    tracing::info!("Final state: {}", serde_json::to_string(&scheduler.info())?);
    Ok(())
}

/// Console (stderr) logging, plus a daily rolling file when `logging.dir` is set.
fn init_tracing(
    gclusterd: &cli::GClusterd,
    config: &Config,
) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let (file_layer, guard) = match &config.logging.dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("gclusterd")
                .filename_suffix("log")
                .max_log_files(7)
                .build(log_dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(gclusterd.verbose.tracing_level_filter())
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn log_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::JobPlaced { job, allocation }) => {
                tracing::info!(
                    "Job {} ({}) placed on {}",
                    job.id,
                    job.user,
                    allocation.node_id
                );
            }
            Ok(SchedulerEvent::JobFailed { job }) => {
                tracing::warn!(
                    "Job {} failed after {} placement attempt(s)",
                    job.id,
                    job.placement_attempts
                );
            }
            Ok(SchedulerEvent::JobCancelled { job }) => {
                tracing::info!("Job {} cancelled", job.id);
            }
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    tracing::debug!("Scheduler event: {}", json);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event logger lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => {
                tracing::info!("Event bus closed, event logger exiting");
                break;
            }
        }
    }
}
