use clap::{Parser, ValueEnum};
use strum::Display;

use crate::error::ProvisionError;

/// Backend label of the error envelope when the arguments named none.
pub const UNKNOWN_BACKEND: &str = "task";

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = "Reads one JSON task request from stdin, provisions or tears down \
                  resources with the chosen backend, and prints one JSON line."
)]
pub struct Cli {
    /// Backend that creates and destroys the resources
    #[arg(value_enum)]
    pub backend: Backend,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

/// The infrastructure substrates a task can target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Backend {
    /// VM pool allocation service
    Abs,
    /// Cloud provisioning facade
    #[value(alias = "provision_service")]
    ProvisionService,
    /// LXD containers and VMs
    Lxd,
    /// Docker containers with SSH
    Docker,
    /// Vagrant machines
    Vagrant,
    /// Terraform on Google Compute Engine
    Terraform,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate.
/// Log output always goes to stderr; stdout carries only the task result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Converts a rejected command line into a validation failure.
///
/// Only the headline of clap's report is kept; usage text stays off stdout.
pub fn usage_error(err: &clap::Error) -> ProvisionError {
    let rendered = err.to_string();
    let headline = rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error:")
        .trim();
    ProvisionError::Validation(format!("invalid arguments: {}", headline))
}
