//! Integrity engine
//!
//! Hashes the current file set, diffs it against the persisted baseline and
//! applies the tamper policy. Policy violations come back as
//! `Err(IntegrityViolation)`; whether that is fatal is the caller's choice
//! (`diff_only` turns it into an informational report).

pub mod baseline;
pub mod diff;
pub mod hash;

pub use baseline::BaselineStore;
pub use diff::{compute_diff, diff, diff_with_mode, Snapshot, SnapshotDiff};
pub use hash::{rolling_hash, ContentDigest, HashAlgorithm, HashEngine, HashError};

use crate::core::FileEntry;
use crate::infrastructure::storage::StorageError;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Tamper policy and ignore rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub allow_deletions: bool,

    #[serde(default)]
    pub allow_additions: bool,

    #[serde(default)]
    pub allow_changes: bool,

    #[serde(default)]
    pub ignore: Vec<String>,

    /// Report violations without failing
    #[serde(default)]
    pub diff_only: bool,

    #[serde(default)]
    pub dev_mode: bool,

    #[serde(default = "default_baseline_path")]
    pub baseline_path: PathBuf,
}

fn default_true() -> bool { true }
fn default_baseline_path() -> PathBuf { PathBuf::from(".inquisidor/guardian/baseline.json") }

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_deletions: false,
            allow_additions: false,
            allow_changes: false,
            ignore: vec![
                "**/node_modules/**".to_string(),
                "**/.git/**".to_string(),
                ".inquisidor/**".to_string(),
            ],
            diff_only: false,
            dev_mode: false,
            baseline_path: default_baseline_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardianStatus {
    #[serde(rename = "baseline-criado")]
    BaselineCreated,
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "alteracoes-detectadas")]
    ChangesDetected,
    #[serde(rename = "baseline-aceito")]
    BaselineAccepted,
}

impl fmt::Display for GuardianStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaselineCreated => write!(f, "baseline-criado"),
            Self::Ok => write!(f, "ok"),
            Self::ChangesDetected => write!(f, "alteracoes-detectadas"),
            Self::BaselineAccepted => write!(f, "baseline-aceito"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardianReport {
    pub status: GuardianStatus,
    /// Entries in the current snapshot
    pub snapshot_size: usize,
    /// Files dropped by the ignore list
    pub ignored: usize,
    /// Files whose hash could not be computed
    pub skipped: Vec<String>,
    pub diff: Option<Arc<SnapshotDiff>>,
    pub violations: Vec<String>,
}

impl GuardianReport {
    fn new(status: GuardianStatus, current: &CurrentSnapshot) -> Self {
        Self {
            status,
            snapshot_size: current.snapshot.len(),
            ignored: current.ignored,
            skipped: current.skipped.clone(),
            diff: None,
            violations: Vec::new(),
        }
    }
}

/// Disallowed changes against the baseline
#[derive(Debug, Clone, Error)]
#[error("integrity violations detected: {}", .messages.join("; "))]
pub struct IntegrityViolation {
    pub messages: Vec<String>,
    pub report: Box<GuardianReport>,
}

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error(transparent)]
    Violation(#[from] IntegrityViolation),

    #[error("baseline persistence failed: {0}")]
    Storage(#[from] StorageError),
}

struct CurrentSnapshot {
    snapshot: Snapshot,
    ignored: usize,
    skipped: Vec<String>,
}

pub struct Guardian {
    config: GuardianConfig,
    ignore: Vec<Pattern>,
    baseline: BaselineStore,
    digest: Arc<dyn ContentDigest>,
}

impl Guardian {
    pub fn new(config: GuardianConfig) -> Self {
        let baseline = BaselineStore::new(config.baseline_path.clone());
        Self::with_parts(config, baseline, Arc::new(HashEngine::default()))
    }

    pub fn with_parts(config: GuardianConfig, baseline: BaselineStore, digest: Arc<dyn ContentDigest>) -> Self {
        let ignore = config
            .ignore
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %glob, error = %e, "Invalid ignore pattern, skipping");
                    None
                }
            })
            .collect();

        Self {
            config,
            ignore,
            baseline,
            digest,
        }
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    pub fn baseline(&self) -> &BaselineStore {
        &self.baseline
    }

    fn is_ignored(&self, rel_path: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.ignore.iter().any(|p| p.matches_with(rel_path, options))
    }

    /// Current snapshot, excluding ignored, blank and unhashable files
    pub fn snapshot(&self, files: &[FileEntry]) -> Snapshot {
        self.current(files).snapshot
    }

    fn current(&self, files: &[FileEntry]) -> CurrentSnapshot {
        let kept: Vec<&FileEntry> = files.iter().filter(|f| !self.is_ignored(&f.rel_path)).collect();
        let ignored = files.len() - kept.len();

        if self.config.dev_mode {
            info!(
                target: "inquisidor::guardian",
                total = files.len(),
                ignored,
                net = kept.len(),
                "Guardian ignore filter applied"
            );
        }

        let mut snapshot = Snapshot::new();
        let mut skipped = Vec::new();

        for file in kept {
            if file.is_blank() {
                continue;
            }
            match self.digest.digest(&file.content) {
                Ok(hash) => {
                    snapshot.insert(file.rel_path.clone(), hash);
                }
                Err(e) => {
                    warn!(file = %file.rel_path, error = %e, "Could not hash file, leaving it out of the snapshot");
                    skipped.push(file.rel_path.clone());
                }
            }
        }

        CurrentSnapshot {
            snapshot,
            ignored,
            skipped,
        }
    }

    fn violations(&self, diff: &SnapshotDiff) -> Vec<String> {
        let mut messages = Vec::new();
        if !self.config.allow_deletions && !diff.removed.is_empty() {
            messages.push(format!("Files removed since baseline: {}", diff.removed.join(", ")));
        }
        if !self.config.allow_additions && !diff.added.is_empty() {
            messages.push(format!("Files added since baseline: {}", diff.added.join(", ")));
        }
        if !self.config.allow_changes && !diff.changed.is_empty() {
            messages.push(format!("Files changed since baseline: {}", diff.changed.join(", ")));
        }
        messages
    }

    /// Enforcing check: any violation is `Err(GuardianError::Violation)`
    #[instrument(skip_all, fields(files = files.len()))]
    pub fn evaluate(&self, files: &[FileEntry]) -> Result<GuardianReport, GuardianError> {
        let current = self.current(files);

        let Some(baseline) = self.baseline.load() else {
            self.baseline.save(&current.snapshot)?;
            info!(entries = current.snapshot.len(), "Guardian baseline created");
            return Ok(GuardianReport::new(GuardianStatus::BaselineCreated, &current));
        };

        let diff = diff_with_mode(&baseline, &current.snapshot, !self.config.diff_only);
        if diff.is_empty() {
            return Ok(GuardianReport::new(GuardianStatus::Ok, &current));
        }

        let violations = self.violations(&diff);
        let mut report = GuardianReport::new(GuardianStatus::ChangesDetected, &current);
        report.diff = Some(diff);
        report.violations = violations.clone();

        if violations.is_empty() {
            info!(
                removed = report.diff.as_ref().map_or(0, |d| d.removed.len()),
                added = report.diff.as_ref().map_or(0, |d| d.added.len()),
                changed = report.diff.as_ref().map_or(0, |d| d.changed.len()),
                "Guardian changes detected, all allowed by policy"
            );
            return Ok(report);
        }

        warn!(violations = violations.len(), "Guardian policy violated");
        Err(IntegrityViolation {
            messages: violations,
            report: Box::new(report),
        }
        .into())
    }

    /// Check honoring the configured mode: in diff-only mode violations are
    /// returned inside the report instead of as an error
    pub fn check(&self, files: &[FileEntry]) -> Result<GuardianReport, GuardianError> {
        match self.evaluate(files) {
            Err(GuardianError::Violation(violation)) if self.config.diff_only => Ok(*violation.report),
            other => other,
        }
    }

    /// Replace the baseline with the current file set
    pub fn accept(&self, files: &[FileEntry]) -> Result<GuardianReport, GuardianError> {
        let current = self.current(files);
        self.baseline.save(&current.snapshot)?;
        info!(entries = current.snapshot.len(), "Guardian baseline accepted");
        Ok(GuardianReport::new(GuardianStatus::BaselineAccepted, &current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guardian(temp: &TempDir, config: GuardianConfig) -> Guardian {
        let config = GuardianConfig {
            baseline_path: temp.path().join("baseline.json"),
            ..config
        };
        Guardian::new(config)
    }

    fn files(pairs: &[(&str, &str)]) -> Vec<FileEntry> {
        pairs.iter().map(|(p, c)| FileEntry::in_memory(*p, *c)).collect()
    }

    #[test]
    fn test_first_run_creates_baseline() {
        let temp = TempDir::new().unwrap();
        let g = guardian(&temp, GuardianConfig::default());

        let report = g.check(&files(&[("a.py", "x = 1")])).unwrap();
        assert_eq!(report.status, GuardianStatus::BaselineCreated);
        assert!(g.baseline().load().is_some());

        let report = g.check(&files(&[("a.py", "x = 1")])).unwrap();
        assert_eq!(report.status, GuardianStatus::Ok);
    }

    #[test]
    fn test_blank_files_never_enter_snapshot() {
        let temp = TempDir::new().unwrap();
        let g = guardian(&temp, GuardianConfig::default());

        let snapshot = g.snapshot(&files(&[("a.py", "x"), ("empty.py", ""), ("ws.py", " \n\t ")]));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("a.py"));
    }

    #[test]
    fn test_ignore_globs() {
        let temp = TempDir::new().unwrap();
        let g = guardian(
            &temp,
            GuardianConfig {
                ignore: vec!["dist/**".into(), "**/*.log".into()],
                dev_mode: true,
                ..GuardianConfig::default()
            },
        );

        let snapshot = g.snapshot(&files(&[("src/a.py", "x"), ("dist/b.js", "y"), ("logs/run.log", "z")]));
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["src/a.py"]);
    }

    #[test]
    fn test_enforce_mode_reports_each_category() {
        let temp = TempDir::new().unwrap();
        let g = guardian(&temp, GuardianConfig::default());
        g.check(&files(&[("gone.py", "1"), ("same.py", "2"), ("edit.py", "3")])).unwrap();

        let err = g
            .check(&files(&[("same.py", "2"), ("edit.py", "33"), ("new.py", "4")]))
            .unwrap_err();
        match err {
            GuardianError::Violation(v) => {
                assert_eq!(v.messages.len(), 3);
                assert_eq!(v.report.status, GuardianStatus::ChangesDetected);
                assert!(v.messages[0].contains("gone.py"));
                assert!(v.messages[1].contains("new.py"));
                assert!(v.messages[2].contains("edit.py"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_all_permissions_allow_changes() {
        let temp = TempDir::new().unwrap();
        let g = guardian(
            &temp,
            GuardianConfig {
                allow_deletions: true,
                allow_additions: true,
                allow_changes: true,
                ..GuardianConfig::default()
            },
        );
        g.check(&files(&[("gone.py", "1"), ("edit.py", "3")])).unwrap();

        let report = g.check(&files(&[("edit.py", "33"), ("new.py", "4")])).unwrap();
        assert_eq!(report.status, GuardianStatus::ChangesDetected);
        assert!(report.violations.is_empty());
        assert_eq!(report.diff.unwrap().total(), 3);
    }

    #[test]
    fn test_diff_only_returns_violations() {
        let temp = TempDir::new().unwrap();
        let g = guardian(
            &temp,
            GuardianConfig {
                diff_only: true,
                ..GuardianConfig::default()
            },
        );
        g.check(&files(&[("a.py", "1")])).unwrap();

        let report = g.check(&files(&[("a.py", "2")])).unwrap();
        assert_eq!(report.status, GuardianStatus::ChangesDetected);
        assert_eq!(report.violations.len(), 1);

        // the enforcing path is still available to the caller
        assert!(matches!(g.evaluate(&files(&[("a.py", "2")])), Err(GuardianError::Violation(_))));
    }

    #[test]
    fn test_blank_file_is_not_reported_removed() {
        let temp = TempDir::new().unwrap();
        let g = guardian(&temp, GuardianConfig::default());
        g.check(&files(&[("a.py", "1"), ("b.py", "2")])).unwrap();

        let report = g.check(&files(&[("a.py", "1"), ("b.py", "2"), ("c.py", "   ")])).unwrap();
        assert_eq!(report.status, GuardianStatus::Ok);
    }

    #[test]
    fn test_accept_replaces_baseline() {
        let temp = TempDir::new().unwrap();
        let g = guardian(&temp, GuardianConfig::default());
        g.check(&files(&[("a.py", "1")])).unwrap();

        let report = g.accept(&files(&[("b.py", "2")])).unwrap();
        assert_eq!(report.status, GuardianStatus::BaselineAccepted);

        let baseline = g.baseline().load().unwrap();
        assert_eq!(baseline.keys().collect::<Vec<_>>(), vec!["b.py"]);
    }

    struct FailingDigest;

    impl ContentDigest for FailingDigest {
        fn digest(&self, content: &str) -> Result<String, HashError> {
            if content.contains("poison") {
                Err(HashError {
                    algorithm: "test".into(),
                    reason: "refused".into(),
                })
            } else {
                Ok(rolling_hash(content))
            }
        }
    }

    #[test]
    fn test_hash_failure_skips_file() {
        let temp = TempDir::new().unwrap();
        let g = Guardian::with_parts(
            GuardianConfig::default(),
            BaselineStore::new(temp.path().join("baseline.json")),
            Arc::new(FailingDigest),
        );

        let report = g.check(&files(&[("a.py", "ok"), ("b.py", "poison")])).unwrap();
        assert_eq!(report.status, GuardianStatus::BaselineCreated);
        assert_eq!(report.snapshot_size, 1);
        assert_eq!(report.skipped, vec!["b.py"]);
    }
}
