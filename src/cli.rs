use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ai_router::models::OperationType;

#[derive(Parser)]
#[command(name = "ai-router")]
#[command(about = "Routes AI operations across interchangeable third-party backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (defaults to the per-user router.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate the configuration
    Validate,

    /// Probe every backend and print its health and metrics
    Status,

    /// Show how a request would be ranked, without sending it
    Rank {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Route a request and print the result
    Process {
        #[command(flatten)]
        request: RequestArgs,

        /// Do not fall back to a second backend on failure
        #[arg(long)]
        no_fallback: bool,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Store a backend secret in the system keyring
    Secret {
        /// Keyring service name
        service: String,

        /// Keyring account name
        account: String,

        /// Secret value to store
        #[arg(short, long)]
        set: String,
    },
}

#[derive(clap::Args)]
pub struct RequestArgs {
    /// Operation to perform (classify, generate, translate, ...)
    #[arg(short, long)]
    pub operation: OperationType,

    /// Input text
    #[arg(short, long)]
    pub text: String,

    /// Operation context as JSON, e.g. '{"target_language": "fr"}'
    #[arg(long)]
    pub context: Option<String>,

    /// Only consider this backend id
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Prefer this model name
    #[arg(short, long)]
    pub model: Option<String>,

    /// Output size hint in tokens
    #[arg(long)]
    pub max_tokens: Option<u32>,
}
