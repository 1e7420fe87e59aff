//! JSON persistence collaborator
//!
//! Baseline and incremental state both go through [`JsonStore`]. The file-system
//! implementation writes atomically: temp file, fsync, rename.

use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait JsonStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted at `path` yet
    fn read(&self, path: &Path) -> Result<Option<Value>, StorageError>;

    /// Full overwrite; parent directories are created as needed
    fn write(&self, path: &Path, value: &Value) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsJsonStore;

impl JsonStore for FsJsonStore {
    fn read(&self, path: &Path) -> Result<Option<Value>, StorageError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StorageError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write(&self, path: &Path, value: &Value) -> Result<(), StorageError> {
        let io_err = |source: io::Error| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let serialized = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(&serialized).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }
}
