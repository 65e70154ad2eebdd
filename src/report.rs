//! Run summaries saved next to each other as JSON and plain text.

use crate::delivery::DeliveryReport;
use crate::models::{MailsiftError, Result};
use crate::pipeline::ExtractionReport;
use chrono::Local;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const RULE: &str = "======================================================================";

/// Summary of a phase that stopped on a fatal error.
#[derive(Debug, Clone)]
pub enum PartialReport {
    Extraction(ExtractionReport),
    Delivery(DeliveryReport),
}

/// A run summary that can be rendered for humans.
pub trait Summary: Serialize {
    /// File name prefix, e.g. `extraction`
    fn kind(&self) -> &'static str;

    fn render_text(&self) -> String;
}

impl Summary for ExtractionReport {
    fn kind(&self) -> &'static str {
        "extraction"
    }

    fn render_text(&self) -> String {
        let mut s = header("EXTRACTION REPORT");
        let _ = writeln!(s, "Units");
        let _ = writeln!(s, "  Total:              {}", self.total_units);
        let _ = writeln!(
            s,
            "  Processed:          {} ({:.1}%)",
            self.processed_units,
            self.success_rate()
        );
        let _ = writeln!(s, "  Failed:             {}", self.failed_units);
        let _ = writeln!(s, "  Remaining:          {}", self.remaining_units);
        let _ = writeln!(s);
        let _ = writeln!(s, "This run");
        let _ = writeln!(s, "  Processed:          {}", self.processed_this_run);
        let _ = writeln!(s, "  Failed:             {}", self.failed_this_run);
        let _ = writeln!(s, "  Records written:    {}", self.records_this_run);
        let _ = writeln!(s, "  Runtime:            {:.1}s", self.runtime_secs);

        if !self.statistics.is_empty() {
            let _ = writeln!(s);
            let _ = writeln!(s, "Counters");
            for (key, value) in &self.statistics {
                let _ = writeln!(s, "  {key:<20}{value}");
            }
        }

        if !self.failed_unit_details.is_empty() {
            let _ = writeln!(s);
            let _ = writeln!(s, "Failed units");
            for failure in &self.failed_unit_details {
                let _ = writeln!(s, "  {}: {}", failure.id, failure.error);
            }
        }

        let _ = writeln!(s);
        let _ = writeln!(s, "Output:     {}", self.output_path.display());
        let _ = writeln!(s, "Checkpoint: {}", self.checkpoint_path.display());
        s.push_str(RULE);
        s.push('\n');
        s
    }
}

impl Summary for DeliveryReport {
    fn kind(&self) -> &'static str {
        "delivery"
    }

    fn render_text(&self) -> String {
        let mut s = header("DELIVERY REPORT");
        let _ = writeln!(s, "Records");
        let _ = writeln!(s, "  Total:              {}", self.total_units);
        let _ = writeln!(
            s,
            "  Delivered:          {} ({:.1}%)",
            self.succeeded, self.success_rate
        );
        let _ = writeln!(s, "  Not delivered:      {}", self.failed);
        let _ = writeln!(s, "  Remote ids:         {}", self.remote_ids.len());
        let _ = writeln!(
            s,
            "  Dropped in partial: {}",
            self.dropped_in_partial_batches
        );
        let _ = writeln!(s);
        let _ = writeln!(s, "Batches");
        let _ = writeln!(s, "  Total:              {}", self.total_batches);
        let _ = writeln!(s, "  Started at:         {}", self.start_batch);
        let _ = writeln!(s, "  Completed:          {}", self.batches_completed);
        let _ = writeln!(s, "  Failed:             {}", self.batches_failed);
        let _ = writeln!(s, "  Resolved later:     {}", self.batches_resolved);
        let _ = writeln!(s, "  Retries:            {}", self.retries);
        let _ = writeln!(s, "  Runtime:            {:.1}s", self.runtime_secs);

        if !self.failed_batches.is_empty() {
            let _ = writeln!(s);
            let _ = writeln!(s, "Failed batches");
            for batch in &self.failed_batches {
                let _ = writeln!(s, "  #{}: {}", batch.batch_index, batch.error);
            }
        }

        if !self.partial_batches.is_empty() {
            let _ = writeln!(s);
            let _ = writeln!(s, "Partial batches");
            for batch in &self.partial_batches {
                let _ = writeln!(
                    s,
                    "  #{}: {} delivered, {} rejected",
                    batch.batch_index, batch.succeeded, batch.failed
                );
                for error in &batch.errors {
                    let _ = writeln!(s, "      {error}");
                }
            }
        }

        s.push_str(RULE);
        s.push('\n');
        s
    }
}

fn header(title: &str) -> String {
    format!(
        "{RULE}\n{title}\nGenerated: {}\n{RULE}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Write `summary` to `dir` as `<kind>_report_<timestamp>.{json,txt}`.
///
/// Returns the JSON and text paths.
pub fn save_report<S: Summary>(summary: &S, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir).map_err(|e| MailsiftError::io("creating report dir", e))?;

    let stem = format!(
        "{}_report_{}",
        summary.kind(),
        Local::now().format("%Y%m%d_%H%M%S")
    );
    let json_path = dir.join(format!("{stem}.json"));
    let text_path = dir.join(format!("{stem}.txt"));

    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| MailsiftError::Internal(format!("Failed to serialize report: {e}")))?;
    fs::write(&json_path, json).map_err(|e| MailsiftError::io("writing JSON report", e))?;
    fs::write(&text_path, summary.render_text())
        .map_err(|e| MailsiftError::io("writing text report", e))?;

    info!(json = %json_path.display(), text = %text_path.display(), "Report saved");
    Ok((json_path, text_path))
}
