//! Incremental state and dispatch prioritization
//!
//! State from the previous run lets unchanged files reuse their results, and its
//! per-file history (time spent, occurrences found, times reused) decides which
//! files are dispatched first.

use super::storage::{FsJsonStore, JsonStore, StorageError};
use crate::core::Occurrence;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    pub enabled: bool,
    /// Skip analysis of files whose hash is unchanged and reuse stored results
    pub reuse_results: bool,
    pub state_path: PathBuf,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reuse_results: true,
            state_path: PathBuf::from(".inquisidor/incremental/state.json"),
        }
    }
}

/// On-disk shape: `{ "arquivos": { "<relPath>": { ... } } }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalState {
    #[serde(rename = "arquivos", default)]
    pub files: BTreeMap<String, IncrementalFileState>,
}

impl IncrementalState {
    pub fn get(&self, rel_path: &str) -> Option<&IncrementalFileState> {
        self.files.get(rel_path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalFileState {
    pub hash: String,
    #[serde(rename = "ocorrencias", default)]
    pub occurrences: Vec<Occurrence>,
    #[serde(rename = "analistas", default)]
    pub analysts: BTreeMap<String, AnalystFileMetric>,
    #[serde(rename = "reaproveitadoCount", default)]
    pub reuse_count: u32,
}

impl IncrementalFileState {
    pub fn total_duration_ms(&self) -> f64 {
        self.analysts.values().map(|a| a.duration_ms).sum()
    }

    pub fn total_occurrences(&self) -> usize {
        self.analysts.values().map(|a| a.occurrences).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalystFileMetric {
    #[serde(rename = "ocorrencias", default)]
    pub occurrences: usize,
    #[serde(rename = "duracaoMs", default)]
    pub duration_ms: f64,
}

pub struct IncrementalStore {
    path: PathBuf,
    store: Arc<dyn JsonStore>,
}

impl IncrementalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_store(path, Arc::new(FsJsonStore))
    }

    pub fn with_store(path: impl Into<PathBuf>, store: Arc<dyn JsonStore>) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, unreadable or malformed state all load as empty
    pub fn load(&self) -> IncrementalState {
        let value = match self.store.read(&self.path) {
            Ok(Some(value)) => value,
            Ok(None) => return IncrementalState::default(),
            Err(e) => {
                warn!(error = %e, "Incremental state unreadable, starting fresh");
                return IncrementalState::default();
            }
        };

        match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Malformed incremental state, starting fresh");
                IncrementalState::default()
            }
        }
    }

    pub fn save(&self, state: &IncrementalState) -> Result<(), StorageError> {
        let value = serde_json::to_value(state).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })?;
        self.store.write(&self.path, &value)?;
        debug!(files = state.files.len(), path = %self.path.display(), "Incremental state saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub duration_weight: f64,
    pub occurrence_weight: f64,
    pub reuse_weight_penalty: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            duration_weight: 1.0,
            occurrence_weight: 10.0,
            reuse_weight_penalty: 5.0,
        }
    }
}

/// Expensive, noisy files score high; files reused often score low
pub fn priority_score(state: &IncrementalFileState, weights: &PriorityWeights) -> f64 {
    weights.duration_weight * state.total_duration_ms()
        + weights.occurrence_weight * state.total_occurrences() as f64
        - weights.reuse_weight_penalty * state.reuse_count as f64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityDecision {
    pub rel_path: String,
    /// `None` for files with no history
    pub score: Option<f64>,
    pub position: usize,
}

/// Compute the dispatch order for `rel_paths`.
///
/// Files without history keep their input order and go first; files with
/// history follow by descending score. Ties keep input order.
pub fn prioritize<'a, I>(rel_paths: I, previous: &IncrementalState, weights: &PriorityWeights) -> Vec<PriorityDecision>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scored: Vec<(String, Option<f64>)> = rel_paths
        .into_iter()
        .map(|rel| (rel.to_string(), previous.get(rel).map(|s| priority_score(s, weights))))
        .collect();

    scored.sort_by(|(_, a), (_, b)| match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.total_cmp(a),
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(position, (rel_path, score))| PriorityDecision {
            rel_path,
            score,
            position,
        })
        .collect()
}
