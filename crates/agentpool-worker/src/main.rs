//! Agent Pool Worker Process
//!
//! Spawned by the pool manager. Protocol on stdout, logs on stderr.

use agentpool_core::{ResourceLimits, WorkerId};
use agentpool_worker::{EnvPolicy, WorkerConfig, WorkerRuntime};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "agentpool-worker")]
#[command(about = "Isolated task worker for the agent pool")]
struct Args {
    /// Id assigned by the pool manager
    #[arg(long)]
    worker_id: Option<u64>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    heartbeat_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when aborting a task
    #[arg(long, default_value_t = 5_000)]
    abort_grace_ms: u64,

    /// Timeout for tasks that carry none
    #[arg(long, default_value_t = 3_600_000)]
    default_timeout_ms: u64,

    /// Declared memory ceiling (MB)
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Declared CPU ceiling (percent of one core)
    #[arg(long)]
    cpu_percent: Option<f32>,

    /// Declared child process limit
    #[arg(long)]
    max_processes: Option<u32>,

    /// Declared open file limit
    #[arg(long)]
    max_open_files: Option<u32>,

    /// Hard cap on any single task (ms)
    #[arg(long)]
    limit_timeout_ms: Option<u64>,

    /// Extra deny pattern (regex), repeatable
    #[arg(long = "deny-pattern")]
    deny_patterns: Vec<String>,

    /// Replace the exact-name env allow-list, repeatable
    #[arg(long = "env-allow")]
    env_allow: Vec<String>,

    /// Replace the prefix env allow-list, repeatable
    #[arg(long = "env-allow-prefix")]
    env_allow_prefix: Vec<String>,
}

impl Args {
    fn into_config(self) -> WorkerConfig {
        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            cpu_percent: self.cpu_percent.unwrap_or(defaults.cpu_percent),
            max_processes: self.max_processes.unwrap_or(defaults.max_processes),
            max_open_files: self.max_open_files.unwrap_or(defaults.max_open_files),
            timeout_ms: self.limit_timeout_ms.unwrap_or(defaults.timeout_ms),
        };

        let mut env_policy = EnvPolicy::default();
        if !self.env_allow.is_empty() {
            env_policy.exact = self.env_allow;
        }
        if !self.env_allow_prefix.is_empty() {
            env_policy.prefixes = self.env_allow_prefix;
        }

        WorkerConfig {
            worker_id: self.worker_id.map(WorkerId::new),
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            abort_grace_ms: self.abort_grace_ms,
            default_timeout_ms: self.default_timeout_ms,
            limits,
            env_policy,
            deny_patterns: self.deny_patterns,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout is the protocol channel
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config();
    info!(
        worker_id = ?config.worker_id,
        heartbeat_ms = config.heartbeat_interval_ms,
        memory_mb = config.limits.memory_mb,
        "Starting agentpool worker"
    );

    let runtime = WorkerRuntime::new(config)?;
    runtime.run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
