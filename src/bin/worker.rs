//! Vault Automation Worker
//!
//! Runs the task queue against an in-memory vault seeded from a JSON file.
//! Queue entries survive restarts through the queue file; entries that were
//! running when the worker stopped are picked up again on the next start.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};

use vault_automation::engine::{FileQueueStore, InMemoryRepository};
use vault_automation::logging::init_logging;
use vault_automation::modules::import_gists::StaticGistFeed;
use vault_automation::{AutomationApp, AutomationConfig};

#[derive(Parser)]
#[command(name = "vault-automation-worker")]
#[command(about = "Vault Automation Worker - Process queued automation tasks")]
#[command(version = "1.0")]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "VAULT_AUTOMATION_CONFIG")]
    config: Option<PathBuf>,

    /// JSON seed with object types and records for the in-memory vault
    #[arg(long, env = "VAULT_AUTOMATION_SEED")]
    seed: Option<PathBuf>,

    /// Queue store file
    #[arg(long, env = "VAULT_AUTOMATION_QUEUE_FILE", default_value = "queue.json")]
    queue_file: PathBuf,

    /// JSON file with gists served to the gist import
    #[arg(long, env = "VAULT_AUTOMATION_GISTS")]
    gists: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();
    let config = AutomationConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging);

    info!("🚀 Starting Vault Automation Worker...");
    info!("=====================================");

    let repository = match &cli.seed {
        Some(path) => {
            info!(seed = %path.display(), "Seeding in-memory vault");
            InMemoryRepository::load_seed(path)
                .await
                .with_context(|| format!("loading seed {}", path.display()))?
        }
        None => {
            warn!("No seed given; starting with an empty vault");
            InMemoryRepository::new()
        }
    };

    let store = FileQueueStore::open(&cli.queue_file)
        .await
        .with_context(|| format!("opening queue file {}", cli.queue_file.display()))?;
    info!(queue_file = %cli.queue_file.display(), "Queue store opened");

    let mut builder = AutomationApp::builder(config)
        .with_repository(Arc::new(repository))
        .with_queue_store(Arc::new(store));

    if let Some(path) = &cli.gists {
        let feed = StaticGistFeed::from_file(path)
            .await
            .with_context(|| format!("loading gists {}", path.display()))?;
        builder = builder.with_gist_feed(Arc::new(feed));
        info!(gists = %path.display(), "✅ Gist feed configured");
    }

    let app = builder.build();
    for module in app.modules() {
        info!(module, "Module enabled");
    }

    app.start().await?;
    info!("✅ Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("🛑 Shutting down...");
    app.stop().await;
    info!("Worker stopped");
    Ok(())
}
