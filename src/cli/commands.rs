//! CLI command definitions for fairq.
//!
//! Every command talks to a Redis-backed shard. Queue settings come from
//! `FAIRQ_*` environment variables (see `QueueConfig::from_env`); flags
//! override the few that matter per command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::queue::shard::{DEFAULT_KEY_PREFIX, DEFAULT_SHARD_NAME};
use crate::queue::{
    EnqueueOpts, Identifier, Item, JobContext, Queue, QueueConfig, QueuePartition, QueueShard,
    RunInfo, RunResult,
};

/// Default Redis connection URL.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Fair, partitioned job queue on Redis.
#[derive(Parser)]
#[command(name = "fairq")]
#[command(about = "Run and inspect a fair, partitioned job queue backed by Redis")]
#[command(version)]
#[command(
    long_about = "fairq stores jobs in per-function or per-queue partitions on Redis and\nprocesses them with a leased, at-least-once worker pool.\n\nExample usage:\n  fairq enqueue --queue emails --payload '{\"to\":\"a@b.c\"}'\n  fairq worker --workers 16"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker pool that logs and acknowledges every item.
    Worker(WorkerArgs),

    /// Enqueue one item.
    Enqueue(EnqueueArgs),

    /// Show the ready items of a partition.
    Peek(PeekArgs),

    /// Show the most recent dead letters.
    Dead(DeadArgs),
}

/// Connection settings shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Redis connection URL.
    #[arg(long, env = "FAIRQ_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Key prefix of the shard.
    #[arg(long, env = "FAIRQ_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub prefix: String,
}

/// Arguments for `fairq worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Number of concurrent executors (overrides FAIRQ_NUM_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Print Prometheus metrics when the worker stops.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `fairq enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Item kind (start, edge, edge-error, sleep, pause, debounce or custom).
    #[arg(short = 'k', long, default_value = "edge")]
    pub kind: String,

    /// Caller identifier. Re-enqueueing the same ID overwrites the item.
    #[arg(long)]
    pub id: Option<String>,

    /// Function the item belongs to.
    #[arg(long)]
    pub function_id: Option<Uuid>,

    /// Account owning the item.
    #[arg(long)]
    pub account_id: Option<Uuid>,

    /// Route the item into a named queue.
    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    /// JSON payload.
    #[arg(short = 'p', long, default_value = "{}")]
    pub payload: String,

    /// Seconds until the item becomes ready.
    #[arg(long, default_value = "0")]
    pub delay_secs: u64,

    /// Maximum number of attempts.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Seconds to move the item ahead of (or behind) its ready time.
    #[arg(long, allow_hyphen_values = true)]
    pub priority_factor: Option<i64>,
}

/// Arguments for `fairq peek`.
#[derive(Parser, Debug)]
pub struct PeekArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Named queue partition. Combine with `--account-id` for an account's
    /// own partition of that queue.
    #[arg(short = 'q', long, conflicts_with = "function_id")]
    pub queue: Option<String>,

    /// Function partition.
    #[arg(long, conflicts_with = "account_id")]
    pub function_id: Option<Uuid>,

    /// All partitions of an account.
    #[arg(long)]
    pub account_id: Option<Uuid>,

    /// Maximum number of items to show.
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,

    /// Include items becoming ready within this many seconds.
    #[arg(long, default_value = "0")]
    pub horizon_secs: u64,
}

impl PeekArgs {
    fn partition(&self) -> QueuePartition {
        if let Some(queue) = &self.queue {
            QueuePartition::queue(queue.clone()).with_account(self.account_id.unwrap_or_default())
        } else if let Some(function_id) = self.function_id {
            QueuePartition::function(function_id)
        } else if let Some(account_id) = self.account_id {
            QueuePartition::account(account_id)
        } else {
            QueuePartition::system()
        }
    }
}

/// Arguments for `fairq dead`.
#[derive(Parser, Debug)]
pub struct DeadArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Maximum number of dead letters to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Peek(args) => run_peek_command(args).await,
        Commands::Dead(args) => run_dead_command(args).await,
    }
}

async fn connect(connection: &ConnectionArgs, config: QueueConfig) -> anyhow::Result<Queue> {
    let shard = QueueShard::redis(
        DEFAULT_SHARD_NAME,
        &connection.redis_url,
        connection.prefix.clone(),
    )
    .await
    .with_context(|| format!("connecting to {}", connection.redis_url))?;

    let queue = Queue::builder(shard)
        .config(config)
        .observer(Arc::new(MetricsCollector::new()))
        .build()?;
    Ok(queue)
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let mut config = QueueConfig::from_env()?;
    if let Some(workers) = args.workers {
        config = config.with_num_workers(workers);
    }
    let queue = connect(&args.connection, config).await?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, draining in-flight items");
        }
        signal.cancel();
    });

    queue.run(cancel, log_item).await?;

    let stats = queue.stats();
    info!(
        completed = stats.jobs_completed,
        retried = stats.jobs_retried,
        dead = stats.jobs_dead,
        leases_lost = stats.leases_lost,
        success_rate = stats.success_rate(),
        average_ms = stats.average_job_duration.as_millis() as u64,
        "Worker finished"
    );

    if args.print_metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

/// Handler used by `fairq worker`: logs the item and acknowledges it.
async fn log_item(ctx: JobContext, info: RunInfo, item: Item) -> anyhow::Result<RunResult> {
    info!(
        job_id = %ctx.job_id(),
        item_id = %ctx.item_id(),
        partition = %info.partition,
        kind = %item.kind,
        attempt = info.attempt,
        latency_ms = info.latency.as_millis() as u64,
        payload = %item.payload,
        "Handled item"
    );
    Ok(RunResult::empty())
}

fn build_item(args: &EnqueueArgs) -> anyhow::Result<Item> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let identifier = Identifier {
        account_id: args.account_id.unwrap_or_default(),
        workflow_id: args.function_id.unwrap_or_default(),
        ..Default::default()
    };
    let mut item = Item::new(args.kind.as_str(), identifier).with_payload(payload);
    if let Some(queue) = &args.queue {
        item = item.with_queue_name(queue.clone());
    }
    if let Some(max_attempts) = args.max_attempts {
        item = item.with_max_attempts(max_attempts);
    }
    if let Some(factor) = args.priority_factor {
        item = item.with_priority_factor(factor);
    }
    Ok(item)
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let item = build_item(&args)?;
    let queue = connect(&args.connection, QueueConfig::from_env()?).await?;

    let mut envelope = crate::queue::QueueItem::from_item(item);
    if let Some(id) = &args.id {
        envelope = envelope.with_id(id.clone());
    }
    let delay = chrono::Duration::from_std(Duration::from_secs(args.delay_secs))
        .context("delay is out of range")?;
    let at = Utc::now() + delay;

    let receipt = queue
        .enqueue_item(DEFAULT_SHARD_NAME, envelope, at, EnqueueOpts::default())
        .await?;

    let output = serde_json::json!({
        "item_id": receipt.item_id,
        "partition": receipt.partition,
        "score_ms": receipt.score_ms,
        "created": receipt.created,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_peek_command(args: PeekArgs) -> anyhow::Result<()> {
    let queue = connect(&args.connection, QueueConfig::from_env()?).await?;
    let horizon = chrono::Duration::from_std(Duration::from_secs(args.horizon_secs))
        .context("horizon is out of range")?;
    let until = Utc::now() + horizon;

    let items = queue.peek(&args.partition(), until, args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

async fn run_dead_command(args: DeadArgs) -> anyhow::Result<()> {
    let queue = connect(&args.connection, QueueConfig::from_env()?).await?;

    let letters = queue.dead_letters(args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&letters)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args() {
        let cli = Cli::try_parse_from(["fairq", "worker", "-w", "8", "--print-metrics"])
            .expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.workers, Some(8));
                assert!(args.print_metrics);
                assert_eq!(args.connection.prefix, DEFAULT_KEY_PREFIX);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_enqueue_args_build_item() {
        let function_id = Uuid::new_v4();
        let function_arg = function_id.to_string();
        let cli = Cli::try_parse_from([
            "fairq",
            "enqueue",
            "--kind",
            "debounce",
            "--function-id",
            function_arg.as_str(),
            "--queue",
            "emails",
            "--payload",
            r#"{"to":"someone"}"#,
            "--priority-factor",
            "-30",
            "--max-attempts",
            "5",
        ])
        .expect("should parse");

        let Commands::Enqueue(args) = cli.command else {
            panic!("Expected Enqueue command");
        };
        let item = build_item(&args).expect("valid item");
        assert_eq!(item.kind.as_str(), "debounce");
        assert_eq!(item.identifier.workflow_id, function_id);
        assert_eq!(item.queue_name.as_deref(), Some("emails"));
        assert_eq!(item.payload["to"], "someone");
        assert_eq!(item.priority_factor(), -30);
        assert_eq!(item.max_attempts, Some(5));
    }

    #[test]
    fn test_enqueue_rejects_bad_payload() {
        let cli = Cli::try_parse_from(["fairq", "enqueue", "--payload", "not json"])
            .expect("should parse");
        let Commands::Enqueue(args) = cli.command else {
            panic!("Expected Enqueue command");
        };
        assert!(build_item(&args).is_err());
    }

    #[test]
    fn test_peek_partition_selection() {
        let cli = Cli::try_parse_from(["fairq", "peek", "-q", "emails", "-n", "3"])
            .expect("should parse");
        let Commands::Peek(args) = cli.command else {
            panic!("Expected Peek command");
        };
        assert_eq!(args.partition(), QueuePartition::queue("emails"));
        assert_eq!(args.limit, 3);

        let cli = Cli::try_parse_from(["fairq", "peek"]).expect("should parse");
        let Commands::Peek(args) = cli.command else {
            panic!("Expected Peek command");
        };
        assert!(args.partition().is_system());

        let account = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "fairq",
            "peek",
            "-q",
            "emails",
            "--account-id",
            account.to_string().as_str(),
        ])
        .expect("should parse");
        let Commands::Peek(args) = cli.command else {
            panic!("Expected Peek command");
        };
        assert_eq!(
            args.partition(),
            QueuePartition::queue("emails").with_account(account)
        );

        let function = Uuid::new_v4().to_string();
        let result = Cli::try_parse_from([
            "fairq",
            "peek",
            "-q",
            "emails",
            "--function-id",
            function.as_str(),
        ]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_log_item_acknowledges() {
        let ctx = JobContext::new("item", Utc::now(), CancellationToken::new());
        let info = RunInfo {
            attempt: 0,
            max_attempts: 3,
            latency: Duration::ZERO,
            shard: DEFAULT_SHARD_NAME.to_string(),
            partition: "p".to_string(),
        };
        let result = log_item(ctx, info, Item::default()).await.expect("ok");
        assert_eq!(result, RunResult::empty());
    }
}
