//! File discovery
//!
//! Produces the `relPath -> FileEntry` map the orchestrator consumes. Paths are
//! relative to the scanned directory and always use `/`.

use super::config::ScanConfig;
use crate::core::types::normalize_rel_path;
use crate::core::FileEntry;
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Invalid scan pattern");
                None
            }
        })
        .collect()
}

/// Collect readable text files under `base_dir` that pass the include/exclude rules
pub fn scan(base_dir: &Path, config: &ScanConfig) -> Result<BTreeMap<String, FileEntry>, glob::PatternError> {
    let include = compile(&config.include);
    let exclude = compile(&config.exclude);
    let root = Pattern::escape(&base_dir.to_string_lossy());

    let mut files = BTreeMap::new();
    for entry in glob::glob_with(&format!("{}/**/*", root), MATCH_OPTIONS)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Error accessing path");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }

        let Ok(relative) = path.strip_prefix(base_dir) else {
            continue;
        };
        let rel_path = normalize_rel_path(&relative.to_string_lossy());

        if exclude.iter().any(|p| p.matches_with(&rel_path, MATCH_OPTIONS)) {
            continue;
        }
        if !include.is_empty() && !include.iter().any(|p| p.matches_with(&rel_path, MATCH_OPTIONS)) {
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(content) => {
                files.insert(rel_path.clone(), FileEntry::new(rel_path, path, content));
            }
            Err(e) => debug!(file = %rel_path, error = %e, "Skipping unreadable file"),
        }
    }

    debug!(files = files.len(), base = %base_dir.display(), "Scan complete");
    Ok(files)
}
