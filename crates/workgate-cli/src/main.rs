use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use workgate_core::domain::WorkError;
use workgate_core::impls::SqliteTaskStore;
use workgate_core::typed::{Handler, Task, WorkContext};
use workgate_core::{
    Constraint, Constraints, Scheduler, SchedulerConfig, TaskFilter, TaskId, TaskRecord,
    TaskState,
};

/// workgate: durable background tasks backed by SQLite
#[derive(Debug, Parser)]
#[command(name = "workgate", version)]
struct Cli {
    /// SQLite database file
    #[arg(long, default_value = "workgate.db", global = true)]
    db: PathBuf,

    /// TOML config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue hello tasks and run them until nothing is left
    Demo {
        /// Names to greet, one task each
        #[arg(default_value = "world")]
        names: Vec<String>,

        /// How many times each task fails before it succeeds
        #[arg(long, default_value_t = 2)]
        failures: u32,

        /// Only run while the (simulated) network is connected
        #[arg(long)]
        needs_network: bool,
    },
    /// Show one task
    Status { id: TaskId },
    /// List tasks, optionally by state
    List {
        #[arg(long)]
        state: Vec<TaskState>,
    },
    /// Count tasks per state
    Counts,
    /// Cancel a task that has not finished
    Cancel { id: TaskId },
    /// Delete a finished task
    Purge { id: TaskId },
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

impl Task for Hello {
    const TYPE: &'static str = "demo.hello.v1";
}

/// Fails the first `failures` attempts of every task, then greets.
struct HelloHandler {
    failures: u32,
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, task: Hello, ctx: WorkContext) -> Result<Vec<u8>, WorkError> {
        if ctx.attempt <= self.failures {
            return Err(WorkError::retryable(format!(
                "intentional failure (attempt {} of {})",
                ctx.attempt,
                self.failures + 1
            ))
            .with_kind("demo"));
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(WorkError::cancelled()),
            _ = sleep(Duration::from_millis(100)) => {
                println!("Hello, {}!", task.name);
                Ok(format!("greeted {}", task.name).into_bytes())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("workgate=info,workgate_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    let store = SqliteTaskStore::open(&cli.db)
        .with_context(|| format!("opening {}", cli.db.display()))?;

    match cli.command {
        Command::Demo {
            names,
            failures,
            needs_network,
        } => demo(store, config, names, failures, needs_network).await,
        command => {
            let scheduler = Scheduler::builder().store(store).config(config).build()?;
            inspect(&scheduler, command).await
        }
    }
}

async fn demo(
    store: SqliteTaskStore,
    mut config: SchedulerConfig,
    names: Vec<String>,
    failures: u32,
    needs_network: bool,
) -> anyhow::Result<()> {
    // デモなので backoff は短く
    config.backoff.base_delay_ms = config.backoff.base_delay_ms.min(200);
    config.backoff.max_delay_ms = config.backoff.max_delay_ms.max(config.backoff.base_delay_ms);
    config.tick_interval_ms = config.tick_interval_ms.min(100);
    config.default_max_attempts = config.default_max_attempts.max(failures + 1);

    let scheduler = Scheduler::builder()
        .store(store)
        .config(config)
        .register::<Hello, _>(HelloHandler { failures })?
        .expect_tasks(&[Hello::TYPE])
        .build()?;

    let constraints = if needs_network {
        Constraints::none().with(Constraint::NetworkConnected)
    } else {
        Constraints::none()
    };
    for name in names {
        let id = scheduler
            .enqueue_typed(&Hello { name }, constraints.clone(), None)
            .await?;
        info!(task_id = %id, "enqueued");
    }

    scheduler.start().await?;
    tokio::select! {
        res = wait_until_settled(&scheduler) => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
    }
    scheduler.shutdown().await;

    let counts = scheduler.counts().await?;
    println!(
        "succeeded={} failed={} cancelled={}",
        counts.succeeded, counts.failed, counts.cancelled
    );
    Ok(())
}

async fn wait_until_settled(scheduler: &Scheduler) -> anyhow::Result<()> {
    loop {
        if scheduler.counts().await?.live() == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn inspect(scheduler: &Scheduler, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status { id } => print_record(&scheduler.status(id).await?),
        Command::List { state } => {
            let filter = if state.is_empty() {
                TaskFilter::all()
            } else {
                TaskFilter::in_states(state)
            };
            let mut records = scheduler.list(filter);
            while let Some(record) = records.next().await {
                print_record(&record?);
            }
        }
        Command::Counts => {
            let counts = scheduler.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Cancel { id } => {
            if scheduler.cancel(id).await? {
                println!("{id} cancelled");
            } else {
                println!("{id} already finished");
            }
        }
        Command::Purge { id } => {
            let record = scheduler.purge(id).await?;
            println!("{id} purged ({})", record.state);
        }
        Command::Demo { .. } => anyhow::bail!("demo builds its own scheduler"),
    }
    Ok(())
}

fn print_record(record: &TaskRecord) {
    println!(
        "{}  {:<9}  {}  attempts={}/{}  next={}",
        record.id,
        record.state.as_str(),
        record.task_type,
        record.attempt_count,
        record.max_attempts,
        record.next_eligible_time.to_rfc3339()
    );
    if let Some(err) = &record.last_error {
        println!("    last_error: {err}");
    }
}
