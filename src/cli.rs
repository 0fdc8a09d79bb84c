//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Exposure Refiner - converge exposure estimates across scanning passes
///
/// Imports contact key packages, runs them through a ladder of
/// increasingly precise scanning passes, and merges each pass into
/// bounded exposure records.
///
/// Examples:
///   exposure-refiner import keys/alice.json
///   exposure-refiner analyze --replay measurements.json
///   exposure-refiner analyze --user Alice --rounds 1
///   exposure-refiner report --format json --output exposures-report.json
///   exposure-refiner init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .exposure-refiner.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Path of the persisted batch store
    #[arg(long, value_name = "FILE", env = "EXPOSURE_REFINER_STORE", global = true)]
    pub store: Option<PathBuf>,

    /// Recorded measurements to replay as the scanning collaborator
    #[arg(long, value_name = "FILE", global = true)]
    pub replay: Option<PathBuf>,

    /// Per-pass timeout in seconds (0 disables)
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Import a contact's key package
    Import {
        /// Key package JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run refinement passes
    Analyze {
        /// Only advance this contact's batch
        #[arg(long, value_name = "NAME")]
        user: Option<String>,

        /// Stop after this many rounds (default: until complete)
        #[arg(long, value_name = "COUNT")]
        rounds: Option<usize>,
    },

    /// Show where every batch stands on the pass ladder
    Status,

    /// Write a report of all batches
    Report {
        /// Output format (markdown, json)
        #[arg(long, default_value = "markdown", value_name = "FORMAT")]
        format: OutputFormat,

        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Delete every batch
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Generate a default .exposure-refiner.toml configuration file
    InitConfig,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        match &self.command {
            Command::Import { file } => {
                if !file.is_file() {
                    return Err(format!("Key package does not exist: {}", file.display()));
                }
            }
            Command::Analyze { user, rounds } => {
                if matches!(user.as_deref(), Some(name) if name.trim().is_empty()) {
                    return Err("User name must not be empty".to_string());
                }
                if *rounds == Some(0) {
                    return Err("Rounds must be at least 1".to_string());
                }
            }
            Command::Clear { yes } => {
                if !yes {
                    return Err("Refusing to delete all batches without --yes".to_string());
                }
            }
            Command::Status | Command::Report { .. } | Command::InitConfig => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
