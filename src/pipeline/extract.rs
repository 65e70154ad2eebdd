//! Phase 1: turn a document corpus into a file of prepared records.
//!
//! Pipeline flow:
//! Scan → Remaining → (read → parse → enrich → validate → prepare → write) per unit → Close
//!
//! Units are handled one at a time. Records are written as soon as a unit is
//! complete; the unit is marked done only after all its records are written.

use crate::checkpoint::{FailedUnit, ProgressTracker};
use crate::models::{ExtractionConfig, MailsiftError, PreparedRecord, Result};
use crate::pipeline::JsonArrayWriter;
use crate::report::PartialReport;
use crate::source::DocumentSource;
use crate::stages::{ArticleParser, Enricher, RecordPreparer, Validator};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{Instrument, Span, error, info, info_span, warn};

/// Where a phase run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    NotStarted,
    Scanning,
    Processing,
    Flushing,
    Done,
}

/// Tunables for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Save the checkpoint after this many completed units
    pub save_interval: usize,
    /// Only consider the first `limit` units of the scan
    pub limit: Option<usize>,
    pub show_progress: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            save_interval: 10,
            limit: None,
            show_progress: false,
        }
    }
}

impl ExtractionSettings {
    pub fn from_config(config: &ExtractionConfig, limit: Option<usize>) -> Self {
        Self {
            save_interval: config.checkpoint_save_interval,
            limit,
            show_progress: config.show_progress,
        }
    }
}

/// Summary of an extraction run.
///
/// Unit counts cover the whole workload across resumes; `*_this_run` fields
/// cover only this invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub total_units: usize,
    pub processed_units: usize,
    pub failed_units: usize,
    pub remaining_units: usize,
    pub processed_this_run: usize,
    pub failed_this_run: usize,
    pub records_this_run: usize,
    /// Counters accumulated in the checkpoint
    pub statistics: std::collections::BTreeMap<String, u64>,
    /// Failures not resolved by a later success
    pub failed_unit_details: Vec<FailedUnit>,
    pub output_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub runtime_secs: f64,
}

impl ExtractionReport {
    pub fn success_rate(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        self.processed_units as f64 / self.total_units as f64 * 100.0
    }
}

/// Resumable extraction over injected stages.
pub struct ExtractionPipeline {
    source: Box<dyn DocumentSource>,
    parser: Box<dyn ArticleParser>,
    enricher: Box<dyn Enricher>,
    validator: Box<dyn Validator>,
    preparer: Box<dyn RecordPreparer>,
    settings: ExtractionSettings,
    state: PhaseState,
    span: Span,
}

impl ExtractionPipeline {
    pub fn new(
        source: Box<dyn DocumentSource>,
        parser: Box<dyn ArticleParser>,
        enricher: Box<dyn Enricher>,
        validator: Box<dyn Validator>,
        preparer: Box<dyn RecordPreparer>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            source,
            parser,
            enricher,
            validator,
            preparer,
            settings,
            state: PhaseState::NotStarted,
            span: info_span!("extract"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// Run phase 1, writing records to `output` and progress to `checkpoint`.
    ///
    /// With `resume`, units recorded as done are skipped and records are
    /// appended to an existing output file. Without it, both start over.
    /// A fatal error after scanning comes back as [`MailsiftError::Aborted`]
    /// with the partial report.
    pub async fn run(
        &mut self,
        output: &Path,
        checkpoint: &Path,
        resume: bool,
    ) -> Result<ExtractionReport> {
        let span = self.span.clone();
        self.run_inner(output, checkpoint, resume)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &mut self,
        output: &Path,
        checkpoint: &Path,
        resume: bool,
    ) -> Result<ExtractionReport> {
        let start = Instant::now();
        let started_at = Utc::now();

        self.state = PhaseState::Scanning;
        let mut tracker = ProgressTracker::open(checkpoint, resume)?
            .with_span(info_span!(parent: &self.span, "progress"));

        let mut workload = self.source.scan()?;
        if let Some(limit) = self.settings.limit
            && workload.len() > limit
        {
            workload.truncate(limit);
            info!(limit, "Limited workload");
        }
        tracker.set_total_units(workload.len());
        tracker.save()?;

        let remaining = tracker.remaining(&workload);
        let mut tally = RunTally::default();

        if remaining.is_empty() {
            info!(total = workload.len(), "No units to process");
            self.state = PhaseState::Done;
            return Ok(self.report(&tracker, &workload, &tally, output, start, started_at));
        }

        self.state = PhaseState::Processing;
        info!(remaining = remaining.len(), total = workload.len(), "Processing units");

        let mut out = if resume {
            JsonArrayWriter::append(output)?
        } else {
            JsonArrayWriter::create(output)?
        };

        let pb = self.progress_bar(remaining.len());
        let processed = self
            .process_remaining(&remaining, &mut tracker, &mut out, &mut tally, &pb)
            .await;

        if let Err(e) = processed {
            pb.abandon();
            if let Err(save_err) = tracker.save() {
                error!(error = %save_err, "Could not save checkpoint after fatal error");
            }
            let partial = self.report(&tracker, &workload, &tally, output, start, started_at);
            error!(
                error = %e,
                processed = partial.processed_units,
                failed = partial.failed_units,
                total = partial.total_units,
                records = partial.records_this_run,
                success_rate = format!("{:.1}%", partial.success_rate()),
                "Extraction aborted"
            );
            return Err(MailsiftError::aborted(e, PartialReport::Extraction(partial)));
        }

        self.state = PhaseState::Flushing;
        out.finish()?;
        tracker.save()?;
        pb.finish_with_message(format!("Done! {} records", tally.records));

        self.state = PhaseState::Done;
        let report = self.report(&tracker, &workload, &tally, output, start, started_at);
        info!(
            processed = report.processed_units,
            failed = report.failed_units,
            total = report.total_units,
            records = report.records_this_run,
            output = %output.display(),
            "Extraction complete"
        );
        Ok(report)
    }

    /// Process `remaining` in order. Unit failures are recorded; only fatal
    /// errors and output or checkpoint I/O errors escape.
    async fn process_remaining(
        &self,
        remaining: &[String],
        tracker: &mut ProgressTracker,
        out: &mut JsonArrayWriter,
        tally: &mut RunTally,
        pb: &ProgressBar,
    ) -> Result<()> {
        let save_interval = self.settings.save_interval.max(1);
        let mut since_save = 0usize;

        for unit_id in remaining {
            match self.process_unit(unit_id).await {
                Ok(records) => {
                    for record in &records {
                        out.write_record(record)?;
                    }
                    tally.count_records(tracker, &records);
                    if records.is_empty() {
                        warn!(unit = %unit_id, "No records extracted");
                        tracker.increment("units_empty", 1);
                    }

                    tracker.mark_done(unit_id);
                    tracker.increment("units_read", 1);
                    tally.processed += 1;
                    since_save += 1;

                    if since_save >= save_interval {
                        tracker.save()?;
                        since_save = 0;
                        info!(
                            processed = tally.processed,
                            remaining = remaining.len(),
                            records = tally.records,
                            "Progress"
                        );
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(unit = %unit_id, error = %e, "Fatal error, stopping");
                    return Err(e);
                }
                Err(e) => {
                    error!(unit = %unit_id, error = %e, "Unit failed");
                    tracker.mark_failed(unit_id, e.to_string());
                    tally.failed += 1;
                }
            }

            pb.inc(1);
            pb.set_message(format!("records: {}, failed: {}", tally.records, tally.failed));
        }
        Ok(())
    }

    /// Read, parse, enrich, validate and prepare one unit. Nothing is written here.
    async fn process_unit(&self, unit_id: &str) -> Result<Vec<PreparedRecord>> {
        let unit = self.source.read(unit_id)?;
        let articles = self.parser.parse(&unit)?;

        let mut prepared = Vec::with_capacity(articles.len());
        for article in articles {
            let enriched = self.enricher.enrich(article).await?;
            let validated = self.validator.validate(enriched)?;
            prepared.push(self.preparer.prepare(&unit, validated)?);
        }
        Ok(prepared)
    }

    fn report(
        &self,
        tracker: &ProgressTracker,
        workload: &[String],
        tally: &RunTally,
        output: &Path,
        start: Instant,
        started_at: DateTime<Utc>,
    ) -> ExtractionReport {
        let cp = tracker.checkpoint();
        let processed = tracker.count_done(workload);
        let outstanding = cp.outstanding_failures();
        let failed_unit_details = cp
            .failed_units
            .iter()
            .filter(|f| !cp.is_processed(&f.id))
            .cloned()
            .collect();

        ExtractionReport {
            total_units: cp.total_units,
            processed_units: processed,
            failed_units: outstanding.len(),
            remaining_units: cp.total_units.saturating_sub(processed),
            processed_this_run: tally.processed,
            failed_this_run: tally.failed,
            records_this_run: tally.records,
            statistics: cp.statistics.clone(),
            failed_unit_details,
            output_path: output.to_path_buf(),
            checkpoint_path: tracker.path().to_path_buf(),
            started_at,
            runtime_secs: start.elapsed().as_secs_f64(),
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

#[derive(Debug, Default)]
struct RunTally {
    processed: usize,
    failed: usize,
    records: usize,
}

impl RunTally {
    fn count_records(&mut self, tracker: &mut ProgressTracker, records: &[PreparedRecord]) {
        self.records += records.len();
        tracker.increment("records_written", records.len() as u64);
        for record in records {
            tracker.increment("hotels_matched", record.hotels.len() as u64);
            tracker.increment("companies_matched", record.companies.len() as u64);
            tracker.increment("contacts_matched", record.contacts.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, load_checkpoint};
    use crate::models::{MailsiftError, ParsedUnit};
    use crate::pipeline::load_records;
    use crate::models::ExtractedRecord;
    use crate::stages::{
        MatchedEntityValidator, PassThroughEnricher, SourcePreparer, WholeMessageParser,
    };
    use std::collections::HashSet;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// In-memory corpus. Records, at each read, how many units the
    /// on-disk checkpoint held.
    struct FakeSource {
        ids: Vec<String>,
        failing: HashSet<String>,
        fatal: HashSet<String>,
        checkpoint: PathBuf,
        reads: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl FakeSource {
        fn new(n: usize, checkpoint: &Path) -> Self {
            Self {
                ids: (1..=n).map(|i| format!("/mail/u{i}.eml")).collect(),
                failing: HashSet::new(),
                fatal: HashSet::new(),
                checkpoint: checkpoint.to_path_buf(),
                reads: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing(mut self, ids: &[&str]) -> Self {
            self.failing = ids.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    impl DocumentSource for FakeSource {
        fn scan(&self) -> Result<Vec<String>> {
            Ok(self.ids.clone())
        }

        fn read(&self, id: &str) -> Result<ParsedUnit> {
            let on_disk = load_checkpoint::<Checkpoint>(&self.checkpoint)
                .unwrap()
                .map(|cp| cp.processed_units)
                .unwrap_or(0);
            self.reads.lock().unwrap().push((id.to_string(), on_disk));

            if self.fatal.contains(id) {
                return Err(MailsiftError::Authentication("enrichment key revoked".into()));
            }
            if self.failing.contains(id) {
                return Err(MailsiftError::ParseError(format!("bad message {id}")));
            }
            Ok(ParsedUnit {
                id: id.to_string(),
                from: "news@example.com".into(),
                subject: format!("Subject of {id}"),
                date: String::new(),
                body_text: "Article body".into(),
                body_html: String::new(),
            })
        }
    }

    fn pipeline(source: FakeSource, save_interval: usize) -> ExtractionPipeline {
        ExtractionPipeline::new(
            Box::new(source),
            Box::new(WholeMessageParser::new().unwrap()),
            Box::new(PassThroughEnricher),
            Box::new(MatchedEntityValidator),
            Box::new(SourcePreparer),
            ExtractionSettings {
                save_interval,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_failed_units_are_skipped_and_flushes_follow_interval() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        let source = FakeSource::new(7, &checkpoint).failing(&["/mail/u4.eml", "/mail/u6.eml"]);
        let reads = Arc::clone(&source.reads);
        let mut pipeline = pipeline(source, 3);

        let report = pipeline.run(&output, &checkpoint, false).await.unwrap();

        assert_eq!(pipeline.state(), PhaseState::Done);
        assert_eq!(report.total_units, 7);
        assert_eq!(report.processed_units, 5);
        assert_eq!(report.failed_units, 2);
        assert_eq!(report.records_this_run, 5);

        let seen: Vec<usize> = reads.lock().unwrap().iter().map(|(_, n)| *n).collect();
        assert_eq!(seen, vec![0, 0, 0, 3, 3, 3, 3]);

        let cp: Checkpoint = load_checkpoint(&checkpoint).unwrap().unwrap();
        assert_eq!(cp.processed_units, 5);
        assert_eq!(cp.failed_units.len(), 2);
        assert_eq!(cp.stat("units_read"), 5);
        assert_eq!(cp.stat("records_written"), 5);

        let records: Vec<PreparedRecord> = load_records(&output).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].headline, "Subject of /mail/u1.eml");
    }

    #[tokio::test]
    async fn test_resume_with_nothing_left_changes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        pipeline(FakeSource::new(4, &checkpoint), 10)
            .run(&output, &checkpoint, false)
            .await
            .unwrap();
        let before = fs::read(&output).unwrap();

        let source = FakeSource::new(4, &checkpoint);
        let reads = Arc::clone(&source.reads);
        let report = pipeline(source, 10)
            .run(&output, &checkpoint, true)
            .await
            .unwrap();

        assert!(reads.lock().unwrap().is_empty());
        assert_eq!(report.processed_this_run, 0);
        assert_eq!(report.records_this_run, 0);
        assert_eq!(report.processed_units, 4);
        assert_eq!(fs::read(&output).unwrap(), before);
    }

    #[tokio::test]
    async fn test_resume_retries_failed_units_and_appends() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        let source = FakeSource::new(5, &checkpoint).failing(&["/mail/u2.eml"]);
        pipeline(source, 10)
            .run(&output, &checkpoint, false)
            .await
            .unwrap();

        let source = FakeSource::new(5, &checkpoint);
        let reads = Arc::clone(&source.reads);
        let report = pipeline(source, 10)
            .run(&output, &checkpoint, true)
            .await
            .unwrap();

        let read_ids: Vec<String> = reads.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(read_ids, vec!["/mail/u2.eml".to_string()]);
        assert_eq!(report.processed_units, 5);
        assert_eq!(report.failed_units, 0);
        assert!(report.failed_unit_details.is_empty());

        let records: Vec<PreparedRecord> = load_records(&output).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].source_unit, "/mail/u2.eml");

        let cp: Checkpoint = load_checkpoint(&checkpoint).unwrap().unwrap();
        assert_eq!(cp.stat("units_read"), 5);
    }

    #[tokio::test]
    async fn test_limit_caps_workload() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        let mut pipeline = ExtractionPipeline::new(
            Box::new(FakeSource::new(6, &checkpoint)),
            Box::new(WholeMessageParser::new().unwrap()),
            Box::new(PassThroughEnricher),
            Box::new(MatchedEntityValidator),
            Box::new(SourcePreparer),
            ExtractionSettings {
                limit: Some(2),
                ..Default::default()
            },
        );
        let report = pipeline.run(&output, &checkpoint, false).await.unwrap();

        assert_eq!(report.total_units, 2);
        assert_eq!(report.processed_units, 2);
        let records: Vec<PreparedRecord> = load_records(&output).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_unit_error_aborts_after_saving() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        let mut source = FakeSource::new(4, &checkpoint);
        source.fatal.insert("/mail/u3.eml".into());
        let mut pipeline = pipeline(source, 10);

        let err = pipeline.run(&output, &checkpoint, false).await.unwrap_err();
        assert!(matches!(err.root(), MailsiftError::Authentication(_)));
        assert_eq!(pipeline.state(), PhaseState::Processing);

        let cp: Checkpoint = load_checkpoint(&checkpoint).unwrap().unwrap();
        assert_eq!(cp.processed_units, 2);
        assert!(!cp.is_processed("/mail/u3.eml"));

        let Some(PartialReport::Extraction(partial)) = err.partial_report() else {
            panic!("expected an extraction partial report, got {err:?}");
        };
        assert_eq!(partial.total_units, 4);
        assert_eq!(partial.processed_units, 2);
        assert_eq!(partial.processed_this_run, 2);
        assert_eq!(partial.records_this_run, 2);
        assert_eq!(partial.remaining_units, 2);
        assert_eq!(partial.success_rate(), 50.0);
    }

    /// Rejects articles whose headline mentions the given word.
    struct RejectHeadline(&'static str);

    impl Validator for RejectHeadline {
        fn validate(&self, record: ExtractedRecord) -> Result<ExtractedRecord> {
            if record.headline.contains(self.0) {
                return Err(MailsiftError::InvalidInput(format!(
                    "rejected {}",
                    record.headline
                )));
            }
            Ok(record)
        }
    }

    #[tokio::test]
    async fn test_validation_error_fails_only_that_unit() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        let mut pipeline = ExtractionPipeline::new(
            Box::new(FakeSource::new(3, &checkpoint)),
            Box::new(WholeMessageParser::new().unwrap()),
            Box::new(PassThroughEnricher),
            Box::new(RejectHeadline("u2")),
            Box::new(SourcePreparer),
            ExtractionSettings::default(),
        );
        let report = pipeline.run(&output, &checkpoint, false).await.unwrap();

        assert_eq!(report.processed_units, 2);
        assert_eq!(report.failed_units, 1);
        assert_eq!(report.failed_unit_details[0].id, "/mail/u2.eml");
        assert!(report.failed_unit_details[0].error.contains("rejected"));

        let records: Vec<PreparedRecord> = load_records(&output).unwrap();
        let headlines: Vec<&str> = records.iter().map(|r| r.headline.as_str()).collect();
        assert_eq!(
            headlines,
            vec!["Subject of /mail/u1.eml", "Subject of /mail/u3.eml"]
        );
    }

    #[tokio::test]
    async fn test_fresh_run_rewrites_output() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("records.json");
        let checkpoint = temp_dir.path().join("checkpoint.json");

        pipeline(FakeSource::new(3, &checkpoint), 10)
            .run(&output, &checkpoint, false)
            .await
            .unwrap();
        let report = pipeline(FakeSource::new(3, &checkpoint), 10)
            .run(&output, &checkpoint, false)
            .await
            .unwrap();

        assert_eq!(report.processed_this_run, 3);
        let records: Vec<PreparedRecord> = load_records(&output).unwrap();
        assert_eq!(records.len(), 3);
    }
}
