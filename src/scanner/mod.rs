//! Boundary to the proximity-scanning collaborator.
//!
//! The collaborator is an opaque oracle: given contact keys and a pass
//! configuration it returns raw exposure measurements. It is long-latency
//! and may fail; the orchestrator treats it as such.

pub mod replay;

use crate::analysis::PassConfiguration;
use crate::models::{DiagnosisKey, RawExposure};
use async_trait::async_trait;

pub use replay::ReplayScanner;

/// Errors reported by a scanning collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("scanning service unavailable: {0}")]
    Unavailable(String),

    #[error("no recorded measurements for cutoffs {low}/{high}")]
    NoRecording { low: u8, high: u8 },

    #[error("failed to read measurements: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode measurements: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The scanning collaborator contract.
#[async_trait]
pub trait ExposureScanner: Send + Sync {
    /// Evaluate `keys` under `config` and return the raw measurements.
    async fn evaluate(
        &self,
        keys: &[DiagnosisKey],
        config: &PassConfiguration,
    ) -> Result<Vec<RawExposure>, ScannerError>;
}
