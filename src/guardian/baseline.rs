//! Baseline store
//!
//! The baseline is a flat `{ "<relPath>": "<hex-hash>" }` JSON object. Loading
//! is lenient: non-string values are dropped, and anything unreadable degrades to
//! "no baseline".

use super::diff::Snapshot;
use crate::infrastructure::storage::{FsJsonStore, JsonStore, StorageError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BaselineStore {
    path: PathBuf,
    store: Arc<dyn JsonStore>,
}

impl BaselineStore {
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

    pub fn load(&self) -> Option<Snapshot> {
        let value = match self.store.read(&self.path) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(path = %self.path.display(), "No baseline persisted yet");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Baseline unreadable, treating as missing");
                return None;
            }
        };

        snapshot_from_value(value)
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let value = Value::Object(
            snapshot
                .iter()
                .map(|(path, hash)| (path.clone(), Value::String(hash.clone())))
                .collect(),
        );
        self.store.write(&self.path, &value)
    }
}

/// Keep string entries of a JSON object; `None` for anything that is not an object
pub fn snapshot_from_value(value: Value) -> Option<Snapshot> {
    let Value::Object(map) = value else {
        warn!("Baseline is not a JSON object, ignoring it");
        return None;
    };

    let total = map.len();
    let snapshot: Snapshot = map
        .into_iter()
        .filter_map(|(path, hash)| match hash {
            Value::String(hash) => Some((path, hash)),
            _ => None,
        })
        .collect();

    if snapshot.len() < total {
        warn!(dropped = total - snapshot.len(), "Dropped non-string baseline entries");
    }
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_filters_non_string_values() {
        let snapshot = snapshot_from_value(json!({"a": "h1", "b": 123, "c": null, "d": "h2"})).unwrap();
        let expected: Snapshot = [("a", "h1"), ("d", "h2")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_rejects_arrays_and_scalars() {
        assert!(snapshot_from_value(json!(["a", "b"])).is_none());
        assert!(snapshot_from_value(json!("a")).is_none());
        assert!(snapshot_from_value(json!(null)).is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let store = BaselineStore::new(temp.path().join("guardian/baseline.json"));
        assert!(store.load().is_none());

        let mut snapshot = Snapshot::new();
        snapshot.insert("src/a.py".into(), "abc".into());
        store.save(&snapshot).unwrap();

        assert_eq!(store.load(), Some(snapshot));
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw, json!({"src/a.py": "abc"}));
    }

    #[test]
    fn test_corrupt_file_loads_as_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("baseline.json");
        std::fs::write(&path, "not json at all").unwrap();

        assert!(BaselineStore::new(&path).load().is_none());
    }
}
