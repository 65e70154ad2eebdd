//! Unit-level progress tracking for resumable extraction runs.
//!
//! - A unit is done once its id is in `processed_unit_ids`; done is final
//! - A failed unit is only logged in `failed_units` and stays remaining, so the
//!   next resume retries it
//! - Ids are compared in normalized form (`a/./b`, `a//b` and `a/b/` are one unit)

use super::store::{load_checkpoint, save_checkpoint};
use crate::models::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tracing::{Span, debug, info, info_span, warn};

/// A unit that failed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Progress record for one extraction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Phase label
    #[serde(default = "default_phase")]
    pub phase: String,
    /// Size of the full workload
    #[serde(default)]
    pub total_units: usize,
    /// Cached `processed_unit_ids.len()` for external tools
    #[serde(default)]
    pub processed_units: usize,
    /// Normalized ids of durably completed units
    #[serde(default)]
    pub processed_unit_ids: HashSet<String>,
    /// Append-only failure log
    #[serde(default)]
    pub failed_units: Vec<FailedUnit>,
    /// Running counters
    #[serde(default)]
    pub statistics: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

fn default_phase() -> String {
    "extract".to_string()
}

impl Default for Checkpoint {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            phase: default_phase(),
            total_units: 0,
            processed_units: 0,
            processed_unit_ids: HashSet::new(),
            failed_units: Vec::new(),
            statistics: BTreeMap::new(),
            started_at: now,
            last_updated: now,
        }
    }
}

impl Checkpoint {
    /// Whether `id` (in any equivalent spelling) is done.
    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_unit_ids.contains(&normalize_unit_id(id))
    }

    /// Distinct failed ids that have not been processed since.
    pub fn outstanding_failures(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.failed_units
            .iter()
            .map(|f| normalize_unit_id(&f.id))
            .filter(|id| !self.processed_unit_ids.contains(id))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Get progress percentage.
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.processed_units as f64 / self.total_units as f64) * 100.0
    }

    /// Read a counter, 0 when absent.
    pub fn stat(&self, key: &str) -> u64 {
        self.statistics.get(key).copied().unwrap_or(0)
    }
}

/// Lexically normalize a unit id.
///
/// Drops `.` segments, resolves `..` against a preceding segment, collapses
/// repeated separators and strips trailing ones. Does not touch the
/// filesystem, so ids of deleted files still compare equal.
pub fn normalize_unit_id(id: &str) -> String {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in Path::new(id.trim()).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return ".".to_string();
    }
    parts
        .iter()
        .map(|c| c.as_os_str())
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

/// Checkpoint plus the workflow decisions built on it.
pub struct ProgressTracker {
    path: PathBuf,
    state: Checkpoint,
    span: Span,
}

impl ProgressTracker {
    /// Start from an empty checkpoint, ignoring anything on disk.
    pub fn fresh(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: Checkpoint::default(),
            span: info_span!("progress"),
        }
    }

    /// Open a tracker: load the checkpoint when resuming, else start fresh.
    ///
    /// A missing checkpoint on resume starts fresh; a corrupt one is an error.
    pub fn open(path: &Path, resume: bool) -> Result<Self> {
        let mut tracker = Self::fresh(path);
        if !resume {
            info!(path = %path.display(), "Starting fresh checkpoint");
            return Ok(tracker);
        }

        match load_checkpoint::<Checkpoint>(path)? {
            Some(mut state) => {
                state.processed_unit_ids = state
                    .processed_unit_ids
                    .iter()
                    .map(|id| normalize_unit_id(id))
                    .collect();
                state.processed_units = state.processed_unit_ids.len();
                info!(
                    processed = state.processed_units,
                    total = state.total_units,
                    failed = state.failed_units.len(),
                    "Resuming from checkpoint"
                );
                tracker.state = state;
            }
            None => {
                warn!(path = %path.display(), "Resume requested but no checkpoint found, starting fresh");
            }
        }
        Ok(tracker)
    }

    /// Log under `span` instead of the default `progress` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Units of `all_unit_ids` not yet done, in input order, each once.
    pub fn remaining(&self, all_unit_ids: &[String]) -> Vec<String> {
        let _guard = self.span.enter();
        let mut seen = HashSet::with_capacity(all_unit_ids.len());
        let remaining: Vec<String> = all_unit_ids
            .iter()
            .filter(|id| {
                let key = normalize_unit_id(id);
                !self.state.processed_unit_ids.contains(&key) && seen.insert(key)
            })
            .cloned()
            .collect();

        info!(
            remaining = remaining.len(),
            total = all_unit_ids.len(),
            "Computed remaining units"
        );
        remaining
    }

    /// How many of `all_unit_ids` are done.
    pub fn count_done(&self, all_unit_ids: &[String]) -> usize {
        all_unit_ids
            .iter()
            .map(|id| normalize_unit_id(id))
            .collect::<HashSet<_>>()
            .iter()
            .filter(|id| self.state.processed_unit_ids.contains(*id))
            .count()
    }

    /// Mark a unit done. Returns false if it already was.
    pub fn mark_done(&mut self, unit_id: &str) -> bool {
        let inserted = self
            .state
            .processed_unit_ids
            .insert(normalize_unit_id(unit_id));
        self.state.processed_units = self.state.processed_unit_ids.len();
        inserted
    }

    /// Record a failure. The unit stays remaining.
    pub fn mark_failed(&mut self, unit_id: &str, error: impl Into<String>) {
        let error = error.into();
        {
            let _guard = self.span.enter();
            warn!(unit = unit_id, error = %error, "Marked as failed");
        }
        self.state.failed_units.push(FailedUnit {
            id: unit_id.to_string(),
            error,
            timestamp: Utc::now(),
        });
    }

    /// Overwrite the given counters, keep the rest.
    pub fn merge_statistics<I, K>(&mut self, delta: I)
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        for (key, value) in delta {
            self.state.statistics.insert(key.into(), value);
        }
    }

    /// Add to a counter.
    pub fn increment(&mut self, key: &str, by: u64) {
        *self.state.statistics.entry(key.to_string()).or_insert(0) += by;
    }

    /// Fix the workload size.
    pub fn set_total_units(&mut self, total: usize) {
        self.state.total_units = total;
    }

    /// Persist the checkpoint atomically.
    pub fn save(&mut self) -> Result<()> {
        self.state.last_updated = Utc::now();
        save_checkpoint(&self.state, &self.path)?;
        let _guard = self.span.enter();
        debug!(
            processed = self.state.processed_units,
            total = self.state.total_units,
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Get reference to state.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state
    }

    /// Checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_unit_id() {
        assert_eq!(normalize_unit_id("/mail/./a.eml"), "/mail/a.eml");
        assert_eq!(normalize_unit_id("/mail//a.eml"), "/mail/a.eml");
        assert_eq!(normalize_unit_id("/mail/sub/../a.eml"), "/mail/a.eml");
        assert_eq!(normalize_unit_id("./a.eml"), "a.eml");
        assert_eq!(normalize_unit_id("mail/"), "mail");
        assert_eq!(normalize_unit_id("../a.eml"), "../a.eml");
        assert_eq!(normalize_unit_id("/.."), "/");
        assert_eq!(normalize_unit_id(""), ".");
    }

    #[test]
    fn test_remaining_excludes_done_and_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));
        let all = ids(&["/m/c.eml", "/m/a.eml", "/m/b.eml"]);

        tracker.mark_done("/m/a.eml");
        assert_eq!(tracker.remaining(&all), ids(&["/m/c.eml", "/m/b.eml"]));
    }

    #[test]
    fn test_remaining_matches_equivalent_spellings() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));
        tracker.mark_done("/m/./a.eml");

        let all = ids(&["/m/a.eml", "/m//b.eml", "/m/b.eml"]);
        assert_eq!(tracker.remaining(&all), ids(&["/m//b.eml"]));
    }

    #[test]
    fn test_done_unit_never_remaining() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));
        let all: Vec<String> = (0..20).map(|i| format!("/m/{i:02}.eml")).collect();

        for k in [0usize, 7, 19] {
            tracker.mark_done(&all[k]);
            let remaining = tracker.remaining(&all);
            assert!(!remaining.contains(&all[k]));
        }
        let remaining = tracker.remaining(&all);
        assert_eq!(remaining.len() + tracker.count_done(&all), all.len());
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));

        assert!(tracker.mark_done("/m/a.eml"));
        assert!(!tracker.mark_done("/m/a.eml"));
        assert!(!tracker.mark_done("/m/./a.eml"));
        assert_eq!(tracker.checkpoint().processed_units, 1);
    }

    #[test]
    fn test_failed_unit_stays_remaining() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));
        let all = ids(&["/m/a.eml", "/m/b.eml"]);

        tracker.mark_failed("/m/a.eml", "bad header");
        tracker.mark_failed("/m/a.eml", "bad header again");
        assert_eq!(tracker.remaining(&all), all);
        assert_eq!(tracker.checkpoint().failed_units.len(), 2);
        assert_eq!(tracker.checkpoint().outstanding_failures(), ids(&["/m/a.eml"]));

        tracker.mark_done("/m/a.eml");
        assert!(tracker.checkpoint().outstanding_failures().is_empty());
    }

    #[test]
    fn test_statistics_merge_and_increment() {
        let temp_dir = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::fresh(&temp_dir.path().join("cp.json"));

        tracker.increment("units_read", 2);
        tracker.increment("units_read", 3);
        tracker.merge_statistics([("records_written", 4u64)]);
        tracker.merge_statistics([("records_written", 6u64)]);

        let cp = tracker.checkpoint();
        assert_eq!(cp.stat("units_read"), 5);
        assert_eq!(cp.stat("records_written"), 6);
        assert_eq!(cp.stat("missing"), 0);
    }

    #[test]
    fn test_resume_loads_saved_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cp.json");

        let mut tracker = ProgressTracker::open(&path, false).unwrap();
        tracker.set_total_units(3);
        tracker.mark_done("/m/a.eml");
        tracker.mark_failed("/m/b.eml", "boom");
        tracker.increment("units_read", 1);
        tracker.save().unwrap();

        let resumed = ProgressTracker::open(&path, true).unwrap();
        let cp = resumed.checkpoint();
        assert_eq!(cp.total_units, 3);
        assert!(cp.is_processed("/m/a.eml"));
        assert_eq!(cp.failed_units.len(), 1);
        assert_eq!(cp.stat("units_read"), 1);
    }

    #[test]
    fn test_open_without_resume_ignores_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cp.json");

        let mut tracker = ProgressTracker::open(&path, false).unwrap();
        tracker.mark_done("/m/a.eml");
        tracker.save().unwrap();

        let fresh = ProgressTracker::open(&path, false).unwrap();
        assert_eq!(fresh.checkpoint().processed_units, 0);
    }

    #[test]
    fn test_resume_with_corrupt_checkpoint_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cp.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(ProgressTracker::open(&path, true).is_err());
    }

    #[test]
    fn test_progress_percent() {
        let mut cp = Checkpoint::default();
        assert_eq!(cp.progress_percent(), 100.0);
        cp.total_units = 4;
        cp.processed_units = 1;
        assert_eq!(cp.progress_percent(), 25.0);
    }
}
