pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod inventory;
pub mod platform;
pub mod protocol;
pub mod task;

use anyhow::{Context, Result};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

pub use error::ProvisionError;

/// Installs the global subscriber, writing to stderr so stdout stays a single JSON line.
pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(filter)
            .with_writer(std::io::stderr)
            .finish(),
    )
    .context("failed to set global default tracing subscriber")
}
