//! Collaborator that replays recorded measurements.
//!
//! Recordings are grouped by the cutoffs of the pass that produced them,
//! so the same file can drive a whole refinement ladder.

use super::{ExposureScanner, ScannerError};
use crate::analysis::PassConfiguration;
use crate::models::{DiagnosisKey, RawExposure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Measurements recorded for one pass configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedPass {
    pub low_cutoff: u8,
    pub high_cutoff: u8,
    #[serde(default)]
    pub exposures: Vec<RawExposure>,
}

/// On-disk recording format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recording {
    pub passes: Vec<RecordedPass>,
}

/// Serves recorded measurements instead of scanning.
#[derive(Debug, Clone, Default)]
pub struct ReplayScanner {
    recording: Recording,
}

impl ReplayScanner {
    pub fn new(recording: Recording) -> Self {
        Self { recording }
    }

    /// Load a recording from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ScannerError> {
        let content = std::fs::read_to_string(path)?;
        let recording: Recording = serde_json::from_str(&content)?;
        info!(
            "Loaded {} recorded passes from {}",
            recording.passes.len(),
            path.display()
        );
        Ok(Self::new(recording))
    }
}

#[async_trait]
impl ExposureScanner for ReplayScanner {
    async fn evaluate(
        &self,
        keys: &[DiagnosisKey],
        config: &PassConfiguration,
    ) -> Result<Vec<RawExposure>, ScannerError> {
        if self.recording.passes.is_empty() {
            return Err(ScannerError::Unavailable(
                "recording holds no passes".to_string(),
            ));
        }

        let recorded = self
            .recording
            .passes
            .iter()
            .find(|p| config.has_cutoffs(p.low_cutoff, p.high_cutoff))
            .ok_or(ScannerError::NoRecording {
                low: config.low_cutoff,
                high: config.high_cutoff,
            })?;

        let levels: HashSet<u8> = keys.iter().map(|k| k.transmission_risk_level).collect();
        let exposures: Vec<RawExposure> = recorded
            .exposures
            .iter()
            .filter(|e| levels.contains(&e.transmission_risk_level))
            .cloned()
            .collect();

        debug!(
            "Replayed {} of {} measurements for cutoffs {}/{}",
            exposures.len(),
            recorded.exposures.len(),
            config.low_cutoff,
            config.high_cutoff
        );
        Ok(exposures)
    }
}
