//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.exposure-refiner.toml` files.

use crate::analysis::passes::{
    LadderError, PassLadder, DEFAULT_DURATION_CAP, DEFAULT_THRESHOLDS, DEFAULT_WEIGHTS,
};
use crate::analysis::profile::DURATION_BUCKETS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".exposure-refiner.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Refinement ladder settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Scanning collaborator settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path of the persisted batch store.
    #[serde(default = "default_store")]
    pub store: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            verbose: false,
        }
    }
}

fn default_store() -> PathBuf {
    PathBuf::from("exposures.json")
}

/// Refinement ladder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Attenuation thresholds, grouped in pairs, one pair per pass.
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<u8>,

    /// Bucket weights (low, medium, high attenuation).
    #[serde(default = "default_weights")]
    pub weights: [u32; DURATION_BUCKETS],

    /// Minutes at which bucket durations saturate.
    #[serde(default = "default_duration_cap")]
    pub duration_cap_minutes: u32,

    /// Per-pass timeout in seconds (0 disables).
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            weights: default_weights(),
            duration_cap_minutes: default_duration_cap(),
            pass_timeout_seconds: default_pass_timeout(),
        }
    }
}

fn default_thresholds() -> Vec<u8> {
    DEFAULT_THRESHOLDS.to_vec()
}

fn default_weights() -> [u32; DURATION_BUCKETS] {
    DEFAULT_WEIGHTS
}

fn default_duration_cap() -> u32 {
    DEFAULT_DURATION_CAP
}

fn default_pass_timeout() -> u64 {
    300 // scans run on a human timescale
}

impl AnalysisConfig {
    /// Build the pass ladder described by this configuration.
    pub fn ladder(&self) -> std::result::Result<PassLadder, LadderError> {
        PassLadder::from_thresholds(&self.thresholds, self.weights, self.duration_cap_minutes)
    }

    /// The per-pass timeout, if enabled.
    pub fn pass_timeout(&self) -> Option<Duration> {
        (self.pass_timeout_seconds > 0).then(|| Duration::from_secs(self.pass_timeout_seconds))
    }
}

/// Scanning collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Recorded measurements served by the replay collaborator.
    #[serde(default = "default_replay")]
    pub replay: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            replay: default_replay(),
        }
    }
}

fn default_replay() -> PathBuf {
    PathBuf::from("measurements.json")
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref store) = args.store {
            self.general.store = store.clone();
        }
        if let Some(ref replay) = args.replay {
            self.scanner.replay = replay.clone();
        }
        if let Some(timeout) = args.timeout {
            self.analysis.pass_timeout_seconds = timeout;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
