//! flashlog CLI
//!
//! Maintenance tools for a directory of flashlog session files.
//!
//! # Commands
//!
//! - `inspect` - Show each session file's header and chunk totals
//! - `verify` - Check header checksums and chunk structure
//! - `dump` - Print the unread payload of session files
//! - `compact` - Rewrite session files to their unread bytes

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// flashlog session log tools.
#[derive(Parser)]
#[command(name = "flashlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the session log directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show each session file's header and chunk totals
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check header checksums and chunk structure
    Verify,

    /// Print the unread payload of session files
    Dump {
        /// Only dump this session id
        #[arg(short, long)]
        session: Option<u8>,

        /// Maximum number of payload bytes per session
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite session files to their unread bytes plus the free band
    Compact {
        /// Dry run - show what would be reclaimed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Log directory required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Log directory required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Dump {
            session,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Log directory required for dump")?;
            commands::dump::run(&path, session, limit, &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Log directory required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("flashlog CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "on-flash format v{}",
                flashlog_core::storage::format::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
