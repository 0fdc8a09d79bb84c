//! The refinement ladder.
//!
//! Each pass asks the scanning collaborator to bucket attenuation with a
//! different pair of cutoffs. Passes run in ladder order; pass 0 is coarse
//! triage and later passes refine it.

use super::bounds::BoundedValue;
use super::profile::DURATION_BUCKETS;
use serde::{Deserialize, Serialize};

/// Default attenuation thresholds, grouped in pairs, one pair per pass.
pub const DEFAULT_THRESHOLDS: [u8; 8] = [50, 56, 44, 53, 59, 65, 47, 62];

/// Default bucket weights (low, medium, high attenuation).
///
/// Only medium-attenuation time counts towards the weighted classification.
pub const DEFAULT_WEIGHTS: [u32; DURATION_BUCKETS] = [0, 6, 0];

/// Minutes at which the collaborator stops counting bucket durations.
pub const DEFAULT_DURATION_CAP: u32 = 30;

/// Precision configuration for one refinement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassConfiguration {
    /// Attenuation below this is the low (closest) bucket.
    pub low_cutoff: u8,
    /// Attenuation at or above this is the high (farthest) bucket.
    pub high_cutoff: u8,
    /// Per-bucket weights for the weighted classification.
    pub weights: [u32; DURATION_BUCKETS],
}

impl PassConfiguration {
    pub fn new(low_cutoff: u8, high_cutoff: u8, weights: [u32; DURATION_BUCKETS]) -> Self {
        Self {
            low_cutoff,
            high_cutoff,
            weights,
        }
    }

    /// Whether this configuration has the given cutoffs.
    pub fn has_cutoffs(&self, low_cutoff: u8, high_cutoff: u8) -> bool {
        self.low_cutoff == low_cutoff && self.high_cutoff == high_cutoff
    }
}

/// Errors building a ladder from raw thresholds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LadderError {
    #[error("no attenuation thresholds configured")]
    Empty,

    #[error("attenuation thresholds must come in pairs, got {0}")]
    Unpaired(usize),

    #[error("pass {pass}: low cutoff {low} must be below high cutoff {high}")]
    Inverted { pass: usize, low: u8, high: u8 },
}

/// Ordered sequence of pass configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassLadder {
    passes: Vec<PassConfiguration>,
    duration_cap: u32,
}

impl PassLadder {
    /// Build a ladder by grouping `thresholds` in pairs.
    pub fn from_thresholds(
        thresholds: &[u8],
        weights: [u32; DURATION_BUCKETS],
        duration_cap: u32,
    ) -> Result<Self, LadderError> {
        if thresholds.is_empty() {
            return Err(LadderError::Empty);
        }
        if thresholds.len() % 2 != 0 {
            return Err(LadderError::Unpaired(thresholds.len()));
        }

        let passes = thresholds
            .chunks_exact(2)
            .enumerate()
            .map(|(pass, pair)| {
                if pair[0] >= pair[1] {
                    return Err(LadderError::Inverted {
                        pass,
                        low: pair[0],
                        high: pair[1],
                    });
                }
                Ok(PassConfiguration::new(pair[0], pair[1], weights))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            passes,
            duration_cap,
        })
    }

    /// Number of passes (N).
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    #[allow(dead_code)] // Required alongside len()
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn get(&self, pass: usize) -> Option<&PassConfiguration> {
        self.passes.get(pass)
    }

    pub fn passes(&self) -> &[PassConfiguration] {
        &self.passes
    }

    #[allow(dead_code)] // Accessor for tests
    pub fn duration_cap(&self) -> u32 {
        self.duration_cap
    }

    /// Bound for a duration reading produced by `pass`.
    ///
    /// Coarse triage (pass 0) only ever yields lower bounds; so does any
    /// reading that reached the collaborator's cap.
    pub fn bound_for(&self, pass: usize, minutes: u32) -> BoundedValue {
        let reading = BoundedValue::from_exact(minutes);
        if pass == 0 || minutes >= self.duration_cap {
            reading.as_lower_bound()
        } else {
            reading
        }
    }
}

impl Default for PassLadder {
    fn default() -> Self {
        let passes = DEFAULT_THRESHOLDS
            .chunks_exact(2)
            .map(|pair| PassConfiguration::new(pair[0], pair[1], DEFAULT_WEIGHTS))
            .collect();
        Self {
            passes,
            duration_cap: DEFAULT_DURATION_CAP,
        }
    }
}
