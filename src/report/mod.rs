//! Batch reports.
//!
//! A [`Report`] is a read-only view over the store: where each batch
//! stands on the ladder and the refined records it holds, with the
//! derived times a reader cares about.

mod generator;

pub use generator::{generate_json_report, generate_markdown_report, generate_status_table};

use crate::analysis::passes::DEFAULT_WEIGHTS;
use crate::analysis::profile::DURATION_BUCKETS;
use crate::analysis::{BoundedValue, DurationProfile, PassLadder};
use crate::models::{Batch, BatchState, ExposureRecord};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Report metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
    /// Cutoff pairs of the ladder, in pass order.
    pub ladder: Vec<(u8, u8)>,
    pub batches: usize,
    pub complete_batches: usize,
    pub total_exposures: usize,
}

/// One refined exposure with its derived times.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureSummary {
    pub day: NaiveDate,
    pub profile: DurationProfile,
    pub duration: BoundedValue,
    /// Minutes in the low and medium attenuation buckets.
    pub close_time: BoundedValue,
    /// Duration not spent close; unknown until the close time is exact.
    pub far_time: BoundedValue,
    pub weighted_time: BoundedValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified_level: Option<u32>,
    pub attenuation_value: u32,
    pub total_risk_score: u32,
    pub pass_count: usize,
}

impl ExposureSummary {
    pub fn from_record(record: &ExposureRecord, weights: &[u32; DURATION_BUCKETS]) -> Self {
        let close_time = record.profile.close_time();

        Self {
            day: record.date.date_naive(),
            profile: record.profile,
            duration: record.duration,
            close_time,
            far_time: record.duration.subtract(close_time),
            weighted_time: record.profile.weighted_time(weights),
            classified_level: record.classified_level,
            attenuation_value: record.attenuation_value,
            total_risk_score: record.total_risk_score,
            pass_count: record.pass_count,
        }
    }
}

/// One batch and its records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub user_name: String,
    pub transmission_risk_level: u8,
    pub date_keys_sent: DateTime<Utc>,
    pub keys: usize,
    pub state: BatchState,
    pub passes_done: usize,
    pub passes_total: usize,
    pub exposures: Vec<ExposureSummary>,
}

impl BatchReport {
    pub fn from_batch(
        batch: &Batch,
        ladder: &PassLadder,
        weights: &[u32; DURATION_BUCKETS],
    ) -> Self {
        let passes_total = Batch::required_passes(ladder.len());

        Self {
            user_name: batch.user_name.clone(),
            transmission_risk_level: batch.transmission_risk_level,
            date_keys_sent: batch.date_keys_sent,
            keys: batch.keys.len(),
            state: batch.state(ladder.len()),
            passes_done: batch.analysis_passes.min(passes_total),
            passes_total,
            exposures: batch
                .exposures
                .values()
                .map(|r| ExposureSummary::from_record(r, weights))
                .collect(),
        }
    }
}

/// Complete report over the store.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub batches: Vec<BatchReport>,
}

impl Report {
    /// Build a report; the classification weights are those of the last pass.
    pub fn build(batches: &[Batch], ladder: &PassLadder, store: Option<PathBuf>) -> Self {
        let weights = ladder
            .passes()
            .last()
            .map(|p| p.weights)
            .unwrap_or(DEFAULT_WEIGHTS);

        let batches: Vec<BatchReport> = batches
            .iter()
            .map(|b| BatchReport::from_batch(b, ladder, &weights))
            .collect();

        let metadata = ReportMetadata {
            generated_at: Utc::now(),
            store,
            ladder: ladder
                .passes()
                .iter()
                .map(|p| (p.low_cutoff, p.high_cutoff))
                .collect(),
            batches: batches.len(),
            complete_batches: batches
                .iter()
                .filter(|b| b.state == BatchState::Complete)
                .count(),
            total_exposures: batches.iter().map(|b| b.exposures.len()).sum(),
        };

        Self { metadata, batches }
    }
}
