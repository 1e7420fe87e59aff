//! Per-technique execution metrics
//!
//! Workers emit one [`AnalystMetric`] per technique execution. The orchestrator
//! folds them into one [`AnalystSummary`] per technique name.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single technique execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalystMetric {
    pub name: String,
    pub duration_ms: f64,
    pub occurrences: usize,
    pub global: bool,
}

impl AnalystMetric {
    pub fn new(name: impl Into<String>, duration: Duration, occurrences: usize, global: bool) -> Self {
        Self {
            name: name.into(),
            duration_ms: duration_ms(duration),
            occurrences,
            global,
        }
    }
}

/// A technique execution attributed to one file, kept for incremental state
#[derive(Debug, Clone, PartialEq)]
pub struct FileAnalystMetric {
    pub rel_path: String,
    pub technique: String,
    pub duration_ms: f64,
    pub occurrences: usize,
}

/// Metrics summed by technique name
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalystSummary {
    pub name: String,
    pub duration_ms: f64,
    pub occurrences: usize,
    pub executions: usize,
    pub global: bool,
}

impl AnalystSummary {
    pub fn mean_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.duration_ms / self.executions as f64
        }
    }
}

/// Sum metrics by name, in order of first appearance
pub fn aggregate_metrics(metrics: &[AnalystMetric]) -> Vec<AnalystSummary> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut summaries: Vec<AnalystSummary> = Vec::new();

    for metric in metrics {
        let slot = *index.entry(metric.name.as_str()).or_insert_with(|| {
            summaries.push(AnalystSummary {
                name: metric.name.clone(),
                duration_ms: 0.0,
                occurrences: 0,
                executions: 0,
                global: metric.global,
            });
            summaries.len() - 1
        });

        let summary = &mut summaries[slot];
        summary.duration_ms += metric.duration_ms;
        summary.occurrences += metric.occurrences;
        summary.executions += 1;
    }

    summaries
}

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Milliseconds elapsed since `start`
pub fn elapsed_ms(start: Instant) -> f64 {
    duration_ms(start.elapsed())
}
