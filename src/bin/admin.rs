//! Vault Automation Admin CLI
//!
//! Inspects and maintains the task queue file written by the worker. Run it
//! while the worker is stopped: opening the store re-queues entries that were
//! interrupted mid-run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use uuid::Uuid;

use vault_automation::engine::{EventBus, FileQueueStore, InMemoryRepository, QueueStore, TaskQueue};
use vault_automation::logging::{init_logging, LoggingConfig};
use vault_automation::models::{EntryState, QueueEntry};
use vault_automation::{AutomationConfig, ConfigStore};

#[derive(Parser)]
#[command(name = "vault-automation-admin")]
#[command(about = "Vault Automation Admin CLI - Inspect and maintain the task queue")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Queue store file
    #[arg(long, env = "VAULT_AUTOMATION_QUEUE_FILE", default_value = "queue.json")]
    queue_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List queue entries
    List {
        /// Only entries in this state
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },

    /// Show one entry including its directive
    Show { id: Uuid },

    /// Cancel a pending entry
    Cancel { id: Uuid },

    /// Put a failed or cancelled entry back into the queue
    Retry { id: Uuid },

    /// Remove finished entries
    Purge {
        /// Confirm the purge
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl From<StateArg> for EntryState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Pending => EntryState::Pending,
            StateArg::InProgress => EntryState::InProgress,
            StateArg::Done => EntryState::Done,
            StateArg::Failed => EntryState::Failed,
            StateArg::Cancelled => EntryState::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        json: false,
    });

    let store: Arc<dyn QueueStore> = Arc::new(FileQueueStore::open(&cli.queue_file).await?);
    // Cancel and retry go through the queue so events and bookkeeping match the worker.
    let queue = TaskQueue::new(
        store.clone(),
        Arc::new(InMemoryRepository::new()),
        ConfigStore::new(AutomationConfig::default()),
        EventBus::new(),
    );

    match cli.command {
        Commands::List { state } => list(&queue, state.map(EntryState::from)).await?,
        Commands::Show { id } => show(&queue, id).await?,
        Commands::Cancel { id } => {
            let state = queue.cancel(id).await?;
            if state == EntryState::Cancelled {
                println!("✅ Cancelled {}", id);
            } else {
                error!(entry_id = %id, %state, "Entry could not be cancelled");
                bail!("entry {} is {}", id, state);
            }
        }
        Commands::Retry { id } => {
            queue.retry(id).await?;
            println!("✅ Re-queued {}", id);
        }
        Commands::Purge { confirm } => {
            if !confirm {
                error!("❌ Purge requires --confirm flag for safety");
                return Ok(());
            }
            purge(store.as_ref()).await?;
        }
    }

    Ok(())
}

async fn list(queue: &TaskQueue, state: Option<EntryState>) -> Result<()> {
    let entries: Vec<QueueEntry> = queue
        .list()
        .await?
        .into_iter()
        .filter(|entry| state.map_or(true, |state| entry.state == state))
        .collect();

    println!("\n📋 Queue entries ({})", entries.len());
    println!("=====================================");

    if entries.is_empty() {
        println!("No entries found.");
        return Ok(());
    }

    for entry in entries {
        println!("🔧 {} [{}] {}", entry.id, entry.state, entry.label());
        println!("   Task type: {} ({:?})", entry.task_type, entry.mode);
        println!("   Attempts: {}", entry.attempts);
        println!("   Available at: {}", entry.available_at.to_rfc3339());
        if let Some(progress) = &entry.progress {
            println!("   Progress: {}", progress);
        }
        if let Some(error) = &entry.last_error {
            println!("   Last error: {}", error);
        }
        println!();
    }
    Ok(())
}

async fn show(queue: &TaskQueue, id: Uuid) -> Result<()> {
    let Some(entry) = queue.get(id).await? else {
        bail!("unknown queue entry {}", id);
    };
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn purge(store: &dyn QueueStore) -> Result<()> {
    let mut removed = 0;
    for entry in store.list().await? {
        if entry.state.is_terminal() && store.remove(entry.id).await? {
            removed += 1;
        }
    }
    info!(removed, "Purged finished entries");
    println!("🧹 Removed {} finished entries", removed);
    Ok(())
}
