use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use job_scheduler::clock::checked_after;
use job_scheduler::config::{AppConfig, CliConfig, FileConfig};
use job_scheduler::{JobQueue, JobState, ScheduleRequest, SchedulerContext, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli_style;

use cli_style::{
    get_styles, print_error, print_key_colored, print_key_value, print_success, state_color,
    TableBuilder,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Storage backend: "document" or "relational".
    #[clap(long)]
    pub backend: Option<String>,

    /// Backend connection string.
    #[clap(long)]
    pub connection_string: Option<String>,

    /// Prefix for the document store collections.
    #[clap(long)]
    pub collection_prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Brings the storage schema to the current version and reports what was done.
    Migrate,

    /// Schedules a job.
    Enqueue {
        job_type: String,

        /// JSON payload.
        #[clap(default_value = "{}")]
        payload: String,

        #[clap(long, default_value = "default")]
        queue: String,

        /// Delay before the job becomes eligible.
        #[clap(long)]
        delay_secs: Option<u64>,

        /// Overrides the configured attempt budget.
        #[clap(long)]
        max_attempts: Option<u32>,
    },

    /// Shows the status of a job.
    Status { id: String },

    /// Shows job counts per state for the given queues.
    Stats {
        #[clap(default_values_t = vec!["default".to_string()])]
        queues: Vec<String>,
    },

    /// Deletes finished jobs older than the given age.
    Purge {
        #[clap(long, default_value_t = 168)]
        older_than_hours: u64,
    },
}

fn run(args: CliArgs) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        backend: args.backend.clone(),
        connection_string: args.connection_string.clone(),
        collection_prefix: args.collection_prefix.clone(),
        ..CliConfig::default()
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let (ctx, report) = SchedulerContext::open(
        &config.storage,
        &config.migration,
        config.queue.clone(),
        Arc::new(SystemClock),
    )
    .context("Failed to open storage")?;
    let queue = JobQueue::new(&ctx);

    match args.command {
        Command::Migrate => {
            print_success(&format!("Schema at version {}", report.to_version));
            print_key_value("Backend", config.storage.backend.as_str());
            print_key_value(
                "Previous version",
                &report
                    .from_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            );
            print_key_value("Outcome", &format!("{:?}", report.outcome));
            for snapshot in &report.snapshots {
                print_key_value("Snapshot", &snapshot.name);
            }
        }
        Command::Enqueue {
            job_type,
            payload,
            queue: queue_name,
            delay_secs,
            max_attempts,
        } => {
            let payload = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut request = ScheduleRequest::new(queue_name, job_type, payload);
            if let Some(delay) = delay_secs {
                let run_at = checked_after(queue.now(), Duration::from_secs(delay))
                    .with_context(|| format!("Delay of {} seconds is out of range", delay))?;
                request = request.run_at(run_at);
            }
            if let Some(max_attempts) = max_attempts {
                request = request.max_attempts(max_attempts);
            }
            let id = queue.schedule(request)?;
            print_success(&format!("Scheduled job {}", id));
        }
        Command::Status { id } => {
            let Some(status) = queue.get_status(&id)? else {
                bail!("No job with id {}", id);
            };
            print_key_value("Id", &status.id);
            print_key_value("Queue", &status.queue);
            print_key_value("Type", &status.job_type);
            print_key_colored("State", status.state.as_str(), state_color(status.state));
            print_key_value(
                "Attempts",
                &format!("{}/{}", status.attempt_count, status.max_attempts),
            );
            if let Some(next) = status.next_run_at {
                print_key_value("Next run", &next.to_rfc3339());
            }
            if let Some(error) = &status.last_error {
                print_key_value("Last error", error);
            }
        }
        Command::Stats { queues } => {
            let mut headers = vec!["queue"];
            headers.extend(JobState::ALL.iter().map(|s| s.as_str()));
            headers.push("total");
            let mut table = TableBuilder::new(headers);
            for queue_name in queues {
                let stats = queue.queue_stats(&queue_name)?;
                table.add_row(vec![
                    queue_name,
                    stats.scheduled.to_string(),
                    stats.ready.to_string(),
                    stats.leased.to_string(),
                    stats.succeeded.to_string(),
                    stats.failed_terminal.to_string(),
                    stats.total().to_string(),
                ]);
            }
            table.print();
        }
        Command::Purge { older_than_hours } => {
            let Some(secs) = older_than_hours.checked_mul(3600) else {
                bail!("Age of {} hours is out of range", older_than_hours);
            };
            let deleted = queue.purge_finished(Duration::from_secs(secs))?;
            print_success(&format!("Deleted {} finished job(s)", deleted));
        }
    }

    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    if let Err(e) = run(args) {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
