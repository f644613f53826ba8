//! Text summary builder for CLI output.
//!
//! This module computes per-pass settle statistics and formats human-readable lines for text mode.

use crate::metrics;
use crate::model::PassReport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build the summary printed after each completed pass.
pub(crate) fn build_pass_summary(report: &PassReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!(
        "Pass {} (started {}): {} steps, {} axis moves in {:.2} s",
        report.pass,
        report.started_utc,
        report.steps,
        report.commands,
        report.elapsed_ms as f64 / 1000.0
    ));

    match metrics::compute_metrics(&report.step_settle_ms) {
        Some((mean, median, p25, p75)) if report.commands > 0 => {
            let slowest = report
                .step_settle_ms
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            lines.push(format!(
                "Step settle: avg {mean:.0} med {median:.0} p25 {p25:.0} p75 {p75:.0} max {slowest:.0} ms"
            ));
        }
        _ => lines.push("Step settle: no motion this pass".to_string()),
    }

    TextSummary { lines }
}
