//! Markdown report generation.
//!
//! This module generates Markdown analysis reports from a finished run.

use crate::models::{Report, ReportMetadata, RunResult};
use anyhow::Result;
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Cookie Analyst Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata, &report.result));
    output.push_str(&generate_rounds_section(&report.result));

    if report.result.is_completed() {
        output.push_str(&generate_analysis_section(&report.result));
    } else {
        output.push_str(&generate_failure_section(&report.result));
    }

    output.push_str(&generate_warnings_section(&report.result.warnings));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata, result: &RunResult) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Run:** `{}`\n", metadata.run_id));
    section.push_str(&format!("- **Analysis:** `{}`\n", metadata.analysis_key));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    section.push_str(&format!("- **Dataset:** {}\n", metadata.dataset));
    section.push_str(&format!("- **Units:** {}\n", metadata.units));
    section.push_str(&format!(
        "- **Status:** {} {}\n",
        result.status.emoji(),
        result.status
    ));
    section.push_str(&format!("- **Backend Calls:** {}\n", result.backend_calls));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the per-round table.
fn generate_rounds_section(result: &RunResult) -> String {
    if result.rounds.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Rounds\n\n");
    section.push_str("| Round | Units | Batches | Failed | Cached |\n");
    section.push_str("|-------|-------|---------|--------|--------|\n");
    for round in &result.rounds {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            round.round, round.units, round.batches, round.failed, round.cached
        ));
    }
    section.push('\n');

    section
}

fn generate_analysis_section(result: &RunResult) -> String {
    let mut section = String::new();

    section.push_str("## Analysis\n\n");
    match result.artifact.as_deref() {
        Some(text) if !text.trim().is_empty() => section.push_str(text.trim()),
        _ => section.push_str("*No records matched; nothing was analyzed.*"),
    }
    section.push_str("\n\n");

    section
}

fn generate_failure_section(result: &RunResult) -> String {
    let mut section = String::new();

    section.push_str("## Failure\n\n");
    let Some(ref failure) = result.failure else {
        section.push_str("The run did not finish.\n\n");
        return section;
    };

    section.push_str(&format!(
        "The run stopped at round {}: {}\n\n",
        failure.round, failure.reason
    ));
    if !failure.failed_batches.is_empty() {
        section.push_str("### Failed Batches\n\n");
        for batch in &failure.failed_batches {
            section.push_str(&format!(
                "- Batch {} ({} attempt(s), {}): {}\n",
                batch.batch_index,
                batch.attempts,
                if batch.transient { "transient" } else { "permanent" },
                batch.reason
            ));
        }
        section.push('\n');
    }
    if !failure.partial_outcomes.is_empty() {
        section.push_str(&format!(
            "{} batch(es) of that round succeeded; their results are kept in the run ledger.\n\n",
            failure.partial_outcomes.len()
        ));
    }

    section
}

fn generate_warnings_section(warnings: &[String]) -> String {
    if warnings.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Warnings\n\n");
    for warning in warnings {
        section.push_str(&format!("- {}\n", warning));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by cookie-analyst*\n".to_string()
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Write a report in the requested format.
pub fn write_report(report: &Report, path: &Path, json: bool) -> Result<()> {
    let content = if json {
        generate_json_report(report)?
    } else {
        generate_markdown_report(report)
    };
    std::fs::write(path, content)?;
    Ok(())
}
