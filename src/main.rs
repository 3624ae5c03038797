use anyhow::{Context, Result};
use clap::Parser;
use job_scheduler::config::{AppConfig, CliConfig, FileConfig};
use job_scheduler::jobs::{self, PurgeFinishedJobsHandler};
use job_scheduler::{metrics, JobQueue, JobRegistry, SchedulerContext, WorkerServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Storage backend: "document" or "relational".
    #[clap(long)]
    pub backend: Option<String>,

    /// Backend connection string, e.g. "sqlite:///var/lib/jobs.db" or "file:///var/lib/jobs.json".
    #[clap(long)]
    pub connection_string: Option<String>,

    /// Prefix for the document store collections.
    #[clap(long)]
    pub collection_prefix: Option<String>,

    /// Name of this server, used in lease owner ids.
    #[clap(long)]
    pub server_name: Option<String>,

    /// Queues to consume. Can be repeated.
    #[clap(long = "queue")]
    pub queues: Vec<String>,

    /// Number of workers per queue.
    #[clap(long)]
    pub workers_per_queue: Option<usize>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long)]
    pub metrics_port: Option<u16>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            backend: self.backend.clone(),
            connection_string: self.connection_string.clone(),
            collection_prefix: self.collection_prefix.clone(),
            server_name: self.server_name.clone(),
            queues: self.queues.clone(),
            workers_per_queue: self.workers_per_queue,
            metrics_port: self.metrics_port,
        }
    }
}

async fn serve_metrics(port: u16, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics port {}: {}", port, e);
            return;
        }
    };
    info!("Metrics available at port {}!", port);
    if let Err(e) = axum::serve(listener, metrics::metrics_router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!("Metrics server error: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    let ctx = SchedulerContext::bootstrap(&config).context("Scheduler startup failed")?;
    let queue = Arc::new(JobQueue::new(&ctx));

    let mut registry = JobRegistry::new();
    jobs::register_builtin(&mut registry, &queue, config.finished_retention);

    if config.finished_retention.is_some() {
        if let Some(maintenance_queue) = config.worker.queues.first() {
            match PurgeFinishedJobsHandler::seed(&queue, maintenance_queue) {
                Ok(Some(id)) => info!("Scheduled finished jobs purge {}", id),
                Ok(None) => info!("Finished jobs purge already scheduled"),
                Err(e) => warn!("Failed to schedule finished jobs purge: {}", e),
            }
        }
    }

    let shutdown = CancellationToken::new();
    let metrics_task = config
        .metrics_port
        .map(|port| tokio::spawn(serve_metrics(port, shutdown.clone())));

    let server = WorkerServer::new(queue, registry, config.worker.clone());
    let handle = server.start(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for in-flight jobs...");
    shutdown.cancel();

    handle.wait_for_shutdown().await;
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            warn!("Metrics server task failed: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}
