//! Ignite Gym CLI - sign in to the gym API and work with your session.
//!
//! Usage:
//! ```bash
//! ignitegym login ana@gym.dev
//! ignitegym status
//! ignitegym history --json
//! ignitegym profile "Ana Maria"
//! ignitegym avatar ~/me.png
//! ignitegym logout
//! ```

mod commands;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ignitegym_core::config::Sealing;
use ignitegym_core::{ApiClient, Config, SessionManager, SessionStore};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of the daily log files under `<data_dir>/logs`.
const LOG_FILE_PREFIX: &str = "ignitegym.log";

/// Environment variable holding the passphrase for a passphrase-sealed store.
const PASSPHRASE_ENV: &str = "IGNITEGYM_STORE_PASSPHRASE";

#[derive(Parser)]
#[command(name = "ignitegym", about = "Ignite Gym command-line client", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// API base URL override
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with e-mail and password
    Login {
        /// Account e-mail (defaults to the last one used)
        email: Option<String>,
    },

    /// Sign out and remove the stored session
    Logout,

    /// Show who is signed in
    Status,

    /// List exercise history grouped by day
    History,

    /// Change the display name
    Profile { name: String },

    /// Upload a new avatar image
    Avatar { path: PathBuf },

    /// Create an account
    Signup { name: String, email: String },
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (filtered by `RUST_LOG`, default `warn`) and to a daily
/// file in the data directory. The returned guard flushes the file on drop.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = Config::data_dir().ok().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .build(dir.join("logs"))
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();
    info!("Ignite Gym CLI starting");

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env();
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }

    let passphrase = match (config.sealing, std::env::var(PASSPHRASE_ENV).ok()) {
        (Sealing::Passphrase, None) => Some(rpassword::prompt_password("Store passphrase: ")?),
        (_, passphrase) => passphrase,
    };
    let backend = config.open_store(passphrase.as_deref()).await?;
    let api = ApiClient::from_config(&config).context("Failed to create API client")?;
    let manager = SessionManager::new(api, SessionStore::new(backend));

    let mut events = manager.subscribe();
    manager.restore().await;

    let result = commands::run(cli.command, &manager, &mut config, cli.json).await;
    commands::report_events(&mut events);

    if let Err(e) = &result {
        warn!(error = %e, "Command failed");
    }
    info!("Ignite Gym CLI shutting down");
    result
}
