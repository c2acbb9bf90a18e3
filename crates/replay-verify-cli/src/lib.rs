//! # replay-verify-cli
//!
//! Command-line interface for distributed replay verification.
//!
//! ## Commands
//!
//! - `replay-verify run` - Replay an interval on the cluster and verify it
//! - `replay-verify plan` - Print the ranges a run would dispatch
//! - `replay-verify cleanup` - Delete pods and volumes left by a run label
//!
//! ## Configuration
//!
//! The CLI uses environment variables or command-line flags for settings:
//!
//! - `REPLAY_VERIFY_KUBE_API_URL` - Kubernetes API server URL
//! - `REPLAY_VERIFY_KUBE_TOKEN` - Pre-issued bearer token
//! - `REPLAY_VERIFY_NAMESPACE` - Namespace for pods and volumes (default: `replay-verify`)
//! - `RUST_LOG` - Log filter (default: `info`)
//!
//! ## Exit codes
//!
//! - `0` - Every scheduled range verified (hard failures are reported only)
//! - `1` - At least one range produced a transaction mismatch, or the run failed
//! - `130` - Interrupted; run resources were cleaned up

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod cluster;
pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use replay_verify::config::DEFAULT_NAMESPACE;
use replay_verify::observability::LogFormat;

/// Replay verification CLI.
#[derive(Debug, Parser)]
#[command(name = "replay-verify")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Kubernetes API server URL.
    #[arg(long, env = "REPLAY_VERIFY_KUBE_API_URL")]
    pub kube_api_url: Option<String>,

    /// Bearer token for the Kubernetes API.
    #[arg(long, env = "REPLAY_VERIFY_KUBE_TOKEN", hide_env_values = true)]
    pub kube_token: Option<String>,

    /// Skip TLS verification of the API server certificate.
    #[arg(long)]
    pub insecure_tls: bool,

    /// Storage class for snapshot volume clones.
    #[arg(long, env = "REPLAY_VERIFY_STORAGE_CLASS")]
    pub storage_class: Option<String>,

    /// Namespace for worker pods and volumes.
    #[arg(long, env = "REPLAY_VERIFY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Log output format.
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            kube_api_url: self.kube_api_url.clone(),
            kube_token: self.kube_token.clone(),
            insecure_tls: self.insecure_tls,
            storage_class: self.storage_class.clone(),
            namespace: self.namespace.clone(),
            format: self.format.clone(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay an interval on the cluster and verify it.
    Run(commands::run::RunArgs),
    /// Print the ranges a run would dispatch.
    Plan(commands::plan::PlanArgs),
    /// Delete pods and volumes carrying a run label.
    Cleanup(commands::cleanup::CleanupArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum LogFormatArg {
    /// Pretty-printed logs.
    #[default]
    Pretty,
    /// JSON structured logs.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Kubernetes API server URL.
    pub kube_api_url: Option<String>,
    /// Bearer token for the Kubernetes API.
    pub kube_token: Option<String>,
    /// Skip TLS verification.
    pub insecure_tls: bool,
    /// Storage class for volume clones.
    pub storage_class: Option<String>,
    /// Namespace for pods and volumes.
    pub namespace: String,
    /// Output format.
    pub format: OutputFormat,
}
