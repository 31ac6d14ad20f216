//! Markdown report generation.
//!
//! This module generates Markdown and JSON reports from a cropping system
//! and, optionally, the summary of the batch that last filled it.

use crate::analysis::{status_distribution, top_steps_by};
use crate::batch::{format_duration, BatchSummary};
use crate::indicators::IndicatorKey;
use crate::models::{format_number, ProcessLogRecord, Status, System};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Columns of the per-step table.
const STEP_COLUMNS: [IndicatorKey; 6] = [
    IndicatorKey::TotalCharges,
    IndicatorKey::TotalProduits,
    IndicatorKey::MargeBrute,
    IndicatorKey::TempsTravail,
    IndicatorKey::Ift,
    IndicatorKey::EmissionsGes,
];

/// Everything rendered in a system report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemReport {
    pub generated_at: DateTime<Utc>,
    pub system: System,
    /// Most recent finished batch on this system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_batch: Option<ProcessLogRecord>,
}

impl SystemReport {
    pub fn new(system: System, last_batch: Option<ProcessLogRecord>) -> Self {
        Self {
            generated_at: Utc::now(),
            system,
            last_batch,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &SystemReport) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Cropping System Report: {}\n\n", report.system.name));
    output.push_str(&generate_metadata_section(report));
    output.push_str(&generate_sources_section(&report.system));
    output.push_str(&generate_steps_section(&report.system));
    output.push_str(&generate_totals_section(&report.system));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(report: &SystemReport) -> String {
    let system = &report.system;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **System:** `{}`\n", system.id));
    section.push_str(&format!(
        "- **Surface:** {} ha\n",
        format_number(system.surface)
    ));
    section.push_str(&format!(
        "- **Rotation:** {} years\n",
        format_number(system.system_indicators.rotation_years)
    ));
    section.push_str(&format!(
        "- **Steps:** {} | **Interventions:** {}\n",
        system.steps.len(),
        system.intervention_count()
    ));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(ref batch) = report.last_batch {
        let duration = batch
            .duration_seconds()
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        section.push_str(&format!(
            "- **Last AI batch:** {} ({}/{} indicators, {})\n",
            batch.status, batch.processed_indicators, batch.total_indicators, duration
        ));
    }
    section.push('\n');

    section
}

/// Where the values come from.
fn generate_sources_section(system: &System) -> String {
    let dist = status_distribution(system);
    if dist.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Value Sources\n\n");
    section.push_str("| User | Calculated | AI | N/A |\n");
    section.push_str("|:---:|:---:|:---:|:---:|\n");

    let count = |status: Status| dist.get(&status).copied().unwrap_or(0);
    section.push_str(&format!(
        "| {} | {} | {} | {} |\n\n",
        count(Status::User),
        count(Status::Calculated),
        count(Status::Ia),
        count(Status::NotApplicable)
    ));

    section
}

/// Generate the per-step table and the ranking by margin.
fn generate_steps_section(system: &System) -> String {
    let mut section = String::new();

    section.push_str("## Steps\n\n");
    if system.steps.is_empty() {
        section.push_str("This system has no steps yet.\n\n");
        return section;
    }

    section.push_str("| Step | Interventions |");
    for key in STEP_COLUMNS {
        section.push_str(&format!(" {} |", key.label()));
    }
    section.push('\n');
    section.push_str("|:---|:---:|");
    for _ in STEP_COLUMNS {
        section.push_str("---:|");
    }
    section.push('\n');

    for step in &system.steps {
        section.push_str(&format!("| {} | {} |", step.name, step.interventions.len()));
        for key in STEP_COLUMNS {
            let cell = match step.values.get(key) {
                Some(entry) if entry.has_value() => format_number(entry.number()),
                _ => "-".to_string(),
            };
            section.push_str(&format!(" {} |", cell));
        }
        section.push('\n');
    }
    section.push('\n');

    let best = top_steps_by(system, IndicatorKey::MargeBrute, 3);
    if !best.is_empty() {
        section.push_str("### Best Steps by Gross Margin\n\n");
        for (i, (step, margin)) in best.iter().enumerate() {
            section.push_str(&format!(
                "{}. {} ({})\n",
                i + 1,
                step.name,
                format_number(*margin)
            ));
        }
        section.push('\n');
    }

    section
}

/// System totals next to their per-hectare-per-year value.
fn generate_totals_section(system: &System) -> String {
    if system.system_values.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## System Totals\n\n");
    section.push_str("| Indicator | Total | Per ha per year |\n");
    section.push_str("|:---|---:|---:|\n");

    for (key, total) in &system.system_values {
        let per_ha = system
            .system_indicators
            .per_hectare_year
            .get(key)
            .map(|v| format_number(*v))
            .unwrap_or_else(|| "-".to_string());
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            key.label(),
            format_number(*total),
            per_ha
        ));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by cropsys*\n".to_string()
}

/// Render a batch summary for the terminal or a file.
pub fn generate_batch_summary(summary: &BatchSummary) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## AI Batch {} ({})\n\n",
        summary.process_log_id, summary.state
    ));
    section.push_str(&format!(
        "- **Processed:** {}/{}\n- **Calculated:** {} | **N/A:** {} | **Errors:** {}\n- **Duration:** {}\n\n",
        summary.processed,
        summary.total,
        summary.calculated_count,
        summary.not_applicable_count,
        summary.error_count,
        format_duration(summary.duration_seconds)
    ));

    if !summary.per_indicator.is_empty() {
        section.push_str("| Indicator | Calculated | N/A | Errors |\n");
        section.push_str("|:---|:---:|:---:|:---:|\n");
        for (key, tally) in &summary.per_indicator {
            section.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                key.label(),
                tally.calculated,
                tally.not_applicable,
                tally.failed
            ));
        }
        section.push('\n');
    }

    if !summary.failures.is_empty() {
        section.push_str("### Failures\n\n");
        for failure in &summary.failures {
            section.push_str(&format!(
                "- {} / {} / {}: {}\n",
                failure.step_name,
                failure.intervention_name,
                failure.item.key.label(),
                failure.error
            ));
        }
        section.push('\n');
    }

    section
}

/// Generate a JSON report.
pub fn generate_json_report(report: &SystemReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
