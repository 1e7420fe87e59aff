//! Pluggable analysis techniques
//!
//! A technique is either per-file (invoked once for every matching file, possibly
//! on a pool worker) or global (invoked once per run on the orchestrator with the
//! whole file set). Global techniques keep their cross-file state in an explicit
//! [`RunAccumulator`] owned by the orchestrator for the duration of one run.

pub mod builtin;

use crate::core::{FileEntryWithAst, Occurrence};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use builtin::{LongFunctions, TodoComments, UsagePatterns};

/// Failure of one technique on one file (or on the global pass)
#[derive(Debug, Clone, Error)]
#[error("{technique}: {message}")]
pub struct TechniqueError {
    pub technique: String,
    pub message: String,
}

impl TechniqueError {
    pub fn new(technique: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            technique: technique.into(),
            message: message.into(),
        }
    }
}

/// Read-only context shared by every technique during one run
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub base_dir: PathBuf,
    pub files: Arc<[FileEntryWithAst]>,
}

impl AnalysisContext {
    pub fn new(base_dir: impl Into<PathBuf>, files: Vec<FileEntryWithAst>) -> Self {
        Self {
            base_dir: base_dir.into(),
            files: files.into(),
        }
    }
}

/// Technique invoked once per matching file
pub trait FileTechnique: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, rel_path: &str) -> bool;

    /// Techniques that need a parsed tree are skipped for files without one
    fn requires_ast(&self) -> bool {
        false
    }

    fn apply(&self, file: &FileEntryWithAst, ctx: &AnalysisContext) -> Result<Vec<Occurrence>, TechniqueError>;
}

/// Technique invoked once per run over the whole file set
pub trait GlobalTechnique: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ctx: &AnalysisContext, acc: &mut RunAccumulator) -> Result<Vec<Occurrence>, TechniqueError>;
}

/// A registered technique
#[derive(Clone)]
pub enum Technique {
    File(Arc<dyn FileTechnique>),
    Global(Arc<dyn GlobalTechnique>),
}

impl Technique {
    pub fn file<T: FileTechnique + 'static>(technique: T) -> Self {
        Self::File(Arc::new(technique))
    }

    pub fn global<T: GlobalTechnique + 'static>(technique: T) -> Self {
        Self::Global(Arc::new(technique))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(t) => t.name(),
            Self::Global(t) => t.name(),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global(_))
    }
}

impl std::fmt::Debug for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Technique")
            .field("name", &self.name())
            .field("global", &self.is_global())
            .finish()
    }
}

/// Default technique set
pub fn default_techniques() -> Vec<Technique> {
    vec![
        Technique::file(TodoComments::default()),
        Technique::file(LongFunctions::default()),
        Technique::global(UsagePatterns::default()),
    ]
}

/// Cross-file counters for global techniques, namespaced by technique name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunAccumulator {
    counters: BTreeMap<String, BTreeMap<String, u64>>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, namespace: &str, key: &str) {
        self.add(namespace, key, 1);
    }

    pub fn add(&mut self, namespace: &str, key: &str, value: u64) {
        *self
            .counters
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default() += value;
    }

    pub fn get(&self, namespace: &str, key: &str) -> u64 {
        self.counters
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .copied()
            .unwrap_or(0)
    }

    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, u64>> {
        self.counters.get(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn reset(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_counts_and_resets() {
        let mut acc = RunAccumulator::new();
        acc.increment("padroes-uso", "os");
        acc.increment("padroes-uso", "os");
        acc.add("padroes-uso", "sys", 5);

        assert_eq!(acc.get("padroes-uso", "os"), 2);
        assert_eq!(acc.get("padroes-uso", "sys"), 5);
        assert_eq!(acc.get("other", "os"), 0);

        acc.reset();
        assert!(acc.is_empty());
    }

    #[test]
    fn test_default_techniques() {
        let techniques = default_techniques();
        assert_eq!(techniques.len(), 3);
        assert_eq!(techniques.iter().filter(|t| t.is_global()).count(), 1);
    }
}
