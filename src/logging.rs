// Structured logging setup

//! # Logging
//!
//! All components log through `tracing` with structured fields (`entry_id`,
//! `task_type`, `record`, ...). [`init_logging`] installs the global
//! subscriber once per process. `RUST_LOG` takes precedence over the
//! configured level, so a single module can be turned up without touching
//! configuration:
//!
//! ```text
//! RUST_LOG=vault_automation::engine::queue=debug worker --config automation.toml
//! ```

use std::io::IsTerminal;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Logging section of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `vault_automation=debug`
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber
///
/// Safe to call more than once; only the first call has an effect. If another
/// subscriber was installed already (e.g. by a test harness) that one is kept.
pub fn init_logging(config: &LoggingConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));

        let result = if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .try_init()
        } else {
            let use_ansi = std::io::stdout().is_terminal();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_ansi(use_ansi))
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping the existing one");
        } else {
            tracing::debug!(level = %config.level, json = config.json, "Logging initialized");
        }
    });
}
