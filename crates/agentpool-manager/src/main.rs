//! Agent Pool manager binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentpool_core::{Task, TaskStatus};
use agentpool_manager::{http, PoolConfig, PoolManager, ProcessLauncher};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "agentpool", version, about = "Pool of isolated agent worker processes")]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    min_workers: Option<usize>,

    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Path to the `agentpool-worker` executable.
    #[arg(long, global = true)]
    worker_bin: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pool behind the HTTP status surface until Ctrl-C.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        http_addr: SocketAddr,
    },
    /// Run a JSON array of tasks, print events as JSON lines, then exit.
    Run {
        tasks: PathBuf,
    },
}

impl Cli {
    fn pool_config(&self) -> Result<PoolConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::load(path)?,
            None => PoolConfig::default(),
        };
        if let Some(min) = self.min_workers {
            config.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if self.worker_bin.is_some() {
            config.worker_bin = self.worker_bin.clone();
        }
        // Keep the initial size inside overridden bounds.
        config.initial_workers = config
            .initial_workers
            .max(config.min_workers)
            .min(config.max_workers);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout carries JSON events in `run` mode
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.pool_config()?;
    let launcher = Arc::new(ProcessLauncher::new(&config));
    info!(
        worker_bin = %launcher.program().display(),
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        "Starting agent pool"
    );
    let pool = PoolManager::start(config, launcher)?;

    match cli.command {
        Commands::Serve { http_addr } => serve(pool, http_addr).await,
        Commands::Run { tasks } => {
            if !run_batch(pool, tasks).await? {
                error!("Not every task completed");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(pool: PoolManager, http_addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let router = http::create_router(pool.clone());
    let listener = TcpListener::bind(http_addr).await?;
    info!(http_addr = %http_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown requested");
        })
        .await?;

    pool.shutdown().await?;
    Ok(())
}

/// Returns whether every task completed.
async fn run_batch(pool: PoolManager, path: PathBuf) -> Result<bool, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read tasks from '{}': {}", path.display(), e))?;
    let tasks: Vec<Task> = serde_json::from_str(&data)?;
    info!(count = tasks.len(), path = %path.display(), "Submitting tasks");

    let mut events = pool.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        handles.push(pool.submit(task).await?);
    }

    let mut all_completed = true;
    for handle in handles {
        let outcome = handle.wait().await?;
        if outcome.status != TaskStatus::Completed {
            warn!(task_id = %outcome.task_id, status = %outcome.status, "Task did not complete");
            all_completed = false;
        }
    }

    pool.shutdown().await?;
    drop(pool);
    // Lets the printer flush the shutdown events.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(all_completed)
}
