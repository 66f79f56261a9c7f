use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use tokio::signal;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quota_pacer::config::{LogFormat, LoggingConfig, ThrottleConfig};
use quota_pacer::ratelimit::{Limiter, Limiters};

/// Push a synthetic workload through a configured limiter.
#[derive(Debug, Parser)]
#[command(name = "quota-pacer", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Limiter to submit tasks to
    #[arg(short, long, default_value = "public")]
    limiter: String,

    /// Number of tasks to submit
    #[arg(short, long, default_value_t = 10)]
    tasks: usize,

    /// Upper bound for the random latency of each task
    #[arg(long, default_value_t = 0)]
    max_latency_ms: u64,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ThrottleConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging, args.log_format);

    info!("Starting quota-pacer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiters = Limiters::from_config(&config.limiters)?;
    let limiter = limiters.get(&args.limiter)?;

    tokio::select! {
        _ = run_workload(Arc::clone(&limiter), args.tasks, args.max_latency_ms) => {
            info!(limiter = %args.limiter, tasks = args.tasks, "Workload finished");
        }
        _ = shutdown_signal() => {
            warn!("Shutdown requested, dropping tasks not yet admitted");
        }
    }

    limiters.drain_idle().await;
    println!("{}", serde_json::to_string_pretty(&limiters.statuses())?);

    info!("quota-pacer stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig, format_override: Option<LogFormat>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format_override.unwrap_or(logging.format) {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Submit `tasks` tasks at once and wait for all of them.
async fn run_workload(limiter: Arc<Limiter>, tasks: usize, max_latency_ms: u64) {
    let latencies: Vec<Duration> = {
        let mut rng = rand::thread_rng();
        (0..tasks)
            .map(|_| Duration::from_millis(rng.gen_range(0..=max_latency_ms)))
            .collect()
    };

    let start = Instant::now();
    let scheduled: Vec<_> = latencies
        .into_iter()
        .enumerate()
        .map(|(index, latency)| {
            limiter.schedule(move || async move {
                let started = start.elapsed();
                sleep(latency).await;
                info!(
                    task = index,
                    started_ms = started.as_millis() as u64,
                    latency_ms = latency.as_millis() as u64,
                    "Task completed"
                );
                index
            })
        })
        .collect();

    let completed = join_all(scheduled).await;
    info!(
        completed = completed.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "All tasks settled"
    );
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
