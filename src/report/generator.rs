//! Markdown and JSON report generation.

use super::{BatchReport, Report, ReportMetadata};
use crate::models::BatchState;
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Exposure Refinement Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_status_section(&report.batches));
    output.push_str(&generate_batches_section(&report.batches));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(store) = &metadata.store {
        section.push_str(&format!("- **Store:** `{}`\n", store.display()));
    }
    let ladder: Vec<String> = metadata
        .ladder
        .iter()
        .map(|(low, high)| format!("{}/{}", low, high))
        .collect();
    section.push_str(&format!("- **Pass Ladder:** {}\n", ladder.join(", ")));
    section.push_str(&format!(
        "- **Batches:** {} ({} complete)\n",
        metadata.batches, metadata.complete_batches
    ));
    section.push_str(&format!("- **Exposures:** {}\n\n", metadata.total_exposures));

    section
}

/// Generate the batch status table used by both the report and `status`.
pub fn generate_status_table(batches: &[BatchReport]) -> String {
    let mut table = String::new();

    table.push_str("| User | Risk Level | Keys | State | Passes | Exposures |\n");
    table.push_str("|:---|:---:|:---:|:---|:---:|:---:|\n");

    for batch in batches {
        table.push_str(&format!(
            "| {} | {} | {} | {} {} | {}/{} | {} |\n",
            batch.user_name,
            batch.transmission_risk_level,
            batch.keys,
            state_emoji(batch.state),
            batch.state,
            batch.passes_done,
            batch.passes_total,
            batch.exposures.len()
        ));
    }

    table
}

fn generate_status_section(batches: &[BatchReport]) -> String {
    let mut section = String::new();

    section.push_str("## Status\n\n");
    if batches.is_empty() {
        section.push_str("No batches imported.\n\n");
        return section;
    }
    section.push_str(&generate_status_table(batches));
    section.push('\n');

    section
}

/// Generate one section per batch with its refined records.
fn generate_batches_section(batches: &[BatchReport]) -> String {
    let mut section = String::new();

    for batch in batches {
        section.push_str(&generate_batch_block(batch));
    }

    section
}

fn generate_batch_block(batch: &BatchReport) -> String {
    let mut block = String::new();

    block.push_str(&format!("## {}\n\n", batch.user_name));
    block.push_str(&format!(
        "Keys sent {}, risk level {}, {}.\n\n",
        batch.date_keys_sent.format("%Y-%m-%d"),
        batch.transmission_risk_level,
        batch.state
    ));

    if batch.exposures.is_empty() {
        block.push_str("No exposures recorded.\n\n");
        return block;
    }

    block.push_str(
        "| Day | Low/Medium/High | Duration | Close | Far | Weighted | Level | Risk Score | Passes |\n",
    );
    block.push_str("|:---|:---:|:---:|:---:|:---:|:---:|:---:|:---:|:---:|\n");

    for exposure in &batch.exposures {
        let level = exposure
            .classified_level
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        block.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |\n",
            exposure.day,
            exposure.profile,
            exposure.duration,
            exposure.close_time,
            exposure.far_time,
            exposure.weighted_time,
            level,
            exposure.total_risk_score,
            exposure.pass_count
        ));
    }
    block.push('\n');

    block
}

fn state_emoji(state: BatchState) -> &'static str {
    match state {
        BatchState::Pending => "⏳",
        BatchState::InPass(_) => "🔄",
        BatchState::Complete => "✅",
    }
}

fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str("*Values prefixed with `>=` are lower bounds.*\n");

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
