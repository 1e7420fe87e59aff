//! Run orchestrator
//!
//! One run: load incremental state, hash and prioritize the file set, resolve
//! ASTs, check integrity, dispatch the files that cannot be reused to the worker
//! pool, then merge, deduplicate and persist the results.

use crate::analysis::{
    AnalysisContext, LongFunctions, RunAccumulator, Technique, TodoComments, UsagePatterns,
};
use crate::core::{FileEntry, FileEntryWithAst, Occurrence};
use crate::frontend::config::{Config, ConfigError};
use crate::frontend::parser::{PythonParser, SourceParser};
use crate::guardian::{BaselineStore, Guardian, GuardianError, GuardianReport, HashEngine, IntegrityViolation};
use crate::infrastructure::ast_cache::{AstCache, AstLookup, CacheStats, ChangeSignature};
use crate::infrastructure::events::{EventLog, StructuredEvent};
use crate::infrastructure::incremental::{
    prioritize, AnalystFileMetric, IncrementalFileState, IncrementalState, IncrementalStore,
    PriorityDecision, PriorityWeights,
};
use crate::infrastructure::metrics::{aggregate_metrics, elapsed_ms, AnalystSummary};
use crate::infrastructure::pool::{ExecutionMode, PoolError, PoolOutcome, WorkerPool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum InquisidorError {
    /// The guardian refused the file set
    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid scan pattern: {0}")]
    Scan(#[from] glob::PatternError),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory the relative paths are anchored at
    pub base_dir: PathBuf,
    pub skip_guardian: bool,
}

impl RunOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            skip_guardian: false,
        }
    }

    pub fn without_guardian(mut self) -> Self {
        self.skip_guardian = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Deduplicated, first occurrence wins in dispatch order
    pub occurrences: Vec<Occurrence>,
    pub metrics: Vec<AnalystSummary>,
    pub guardian: Option<GuardianReport>,
    pub files_total: usize,
    pub files_analyzed: usize,
    pub files_reused: usize,
    pub parse_failures: usize,
    pub total_errors: usize,
    pub pool_errors: Vec<PoolError>,
    /// Cache activity of this run only
    pub cache: CacheStats,
    /// Empty when no priority weights are configured
    pub priorities: Vec<PriorityDecision>,
    pub mode: ExecutionMode,
    pub duration_ms: f64,
}

impl RunReport {
    pub fn has_errors(&self) -> bool {
        self.total_errors > 0 || self.parse_failures > 0
    }

    pub fn occurrences_for<'a>(&'a self, rel_path: &'a str) -> impl Iterator<Item = &'a Occurrence> + 'a {
        self.occurrences.iter().filter(move |o| o.rel_path == rel_path)
    }
}

pub struct Inquisidor {
    config: Config,
    techniques: Vec<Technique>,
    hasher: HashEngine,
    ast_cache: AstCache,
    guardian: Option<Guardian>,
    state: IncrementalStore,
    pool: WorkerPool,
    events: EventLog,
}

impl Inquisidor {
    pub fn new(config: Config) -> Self {
        let hasher = HashEngine::new(&config.hash.preference);
        let guardian = config.guardian.enabled.then(|| {
            Guardian::with_parts(
                config.guardian.clone(),
                BaselineStore::new(config.guardian.baseline_path.clone()),
                Arc::new(hasher.clone()),
            )
        });
        let techniques = vec![
            Technique::file(TodoComments),
            Technique::file(LongFunctions {
                max_lines: config.techniques.max_function_lines,
            }),
            Technique::global(UsagePatterns {
                min_files: config.techniques.usage_min_files,
            }),
        ];

        Self {
            techniques,
            hasher,
            ast_cache: Self::cache_for(&config, Arc::new(PythonParser)),
            guardian,
            state: IncrementalStore::new(config.incremental.state_path.clone()),
            pool: WorkerPool::new(config.pool.clone()),
            events: EventLog::new(config.logging.structured),
            config,
        }
    }

    fn cache_for(config: &Config, parser: Arc<dyn SourceParser>) -> AstCache {
        AstCache::new(parser, config.parse.cache_capacity, config.parse.timeout_ms)
    }

    pub fn with_parser(mut self, parser: Arc<dyn SourceParser>) -> Self {
        self.ast_cache = Self::cache_for(&self.config, parser);
        self
    }

    pub fn with_techniques(mut self, techniques: Vec<Technique>) -> Self {
        self.techniques = techniques;
        self
    }

    pub fn with_guardian(mut self, guardian: Option<Guardian>) -> Self {
        self.guardian = guardian;
        self
    }

    pub fn with_state_store(mut self, store: IncrementalStore) -> Self {
        self.state = store;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn techniques(&self) -> &[Technique] {
        &self.techniques
    }

    pub fn guardian(&self) -> Option<&Guardian> {
        self.guardian.as_ref()
    }

    pub fn ast_cache(&self) -> &AstCache {
        &self.ast_cache
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Analyse `files`.
    ///
    /// Fails only on an integrity violation; everything else (parse failures,
    /// technique errors, timed-out batches, unwritable state) degrades into the
    /// report.
    #[instrument(skip_all, fields(base = %options.base_dir.display()))]
    pub fn run<I>(&self, files: I, options: &RunOptions) -> Result<RunReport, InquisidorError>
    where
        I: IntoIterator<Item = FileEntry>,
    {
        let start = Instant::now();
        self.ast_cache.reset_stats();
        let incremental = &self.config.incremental;
        let reuse_enabled = incremental.enabled && incremental.reuse_results;

        let previous = if incremental.enabled {
            self.state.load()
        } else {
            IncrementalState::default()
        };
        self.ast_cache.seed_persisted(
            previous
                .files
                .iter()
                .map(|(rel, file)| (rel.clone(), ChangeSignature::hash(file.hash.clone()))),
        );

        let files = unique_by_path(files);
        let hashes: HashMap<String, String> = files
            .iter()
            .map(|f| (f.rel_path.clone(), self.hasher.hash(&f.content)))
            .collect();
        info!(files = files.len(), previous = previous.files.len(), "Run started");

        let (files, priorities) = match &self.config.priority {
            Some(weights) => self.prioritized(files, &previous, weights),
            None => (files, Vec::new()),
        };

        // AST step, in dispatch order
        let mut dispatch: Vec<FileEntryWithAst> = Vec::with_capacity(files.len());
        let mut parse_errors: Vec<Occurrence> = Vec::new();
        let mut reused: HashSet<String> = HashSet::new();

        for entry in files {
            let hash = hashes.get(&entry.rel_path).cloned().unwrap_or_default();
            let unchanged = previous.get(&entry.rel_path).is_some_and(|p| p.hash == hash);
            let reuse = reuse_enabled && unchanged;

            let file = match self.ast_cache.resolve(&entry, &ChangeSignature::hash(hash), reuse) {
                AstLookup::Cached(tree) | AstLookup::Parsed(tree) => FileEntryWithAst::new(entry, tree),
                AstLookup::Persisted => FileEntryWithAst::new(entry, None),
                AstLookup::Failed(e) => {
                    parse_errors.push(Occurrence::parse_error(&entry.rel_path, e.to_string()));
                    FileEntryWithAst::failed(entry, e.to_string())
                }
            };

            if reuse {
                reused.insert(file.rel_path().to_string());
            }
            dispatch.push(file);
        }

        let guardian = self.check_integrity(&dispatch, options)?;

        let context = AnalysisContext::new(options.base_dir.clone(), dispatch.clone());
        let to_analyze: Vec<FileEntryWithAst> = dispatch
            .iter()
            .filter(|f| !reused.contains(f.rel_path()))
            .cloned()
            .collect();
        debug!(analyze = to_analyze.len(), reused = reused.len(), "Dispatching");

        let mut accumulator = RunAccumulator::new();
        let outcome = self
            .pool
            .process_files(to_analyze, &self.techniques, &context, &mut accumulator);

        let occurrences = merge_occurrences(&dispatch, &reused, &previous, &parse_errors, &outcome);
        let metrics = aggregate_metrics(&outcome.metrics);

        if incremental.enabled {
            let next = next_state(&dispatch, &hashes, &reused, &previous, &parse_errors, &outcome);
            if let Err(e) = self.state.save(&next) {
                warn!(error = %e, "Could not persist incremental state");
            }
        }

        let report = RunReport {
            occurrences,
            metrics,
            guardian,
            files_total: dispatch.len(),
            files_analyzed: outcome.total_processed,
            files_reused: reused.len(),
            parse_failures: parse_errors.len(),
            total_errors: outcome.total_errors,
            pool_errors: outcome.errors,
            cache: self.ast_cache.stats(),
            priorities,
            mode: outcome.mode,
            duration_ms: elapsed_ms(start),
        };

        self.emit_run_events(&report);
        info!(
            occurrences = report.occurrences.len(),
            analyzed = report.files_analyzed,
            reused = report.files_reused,
            errors = report.total_errors,
            duration_ms = report.duration_ms,
            "Run finished"
        );
        Ok(report)
    }

    fn prioritized(
        &self,
        files: Vec<FileEntry>,
        previous: &IncrementalState,
        weights: &PriorityWeights,
    ) -> (Vec<FileEntry>, Vec<PriorityDecision>) {
        let decisions = prioritize(files.iter().map(|f| f.rel_path.as_str()), previous, weights);

        let mut by_path: HashMap<String, FileEntry> =
            files.into_iter().map(|f| (f.rel_path.clone(), f)).collect();
        let ordered = decisions
            .iter()
            .filter_map(|d| by_path.remove(&d.rel_path))
            .collect();

        for decision in &decisions {
            self.events.emit(StructuredEvent::Priorizacao {
                arquivo: decision.rel_path.clone(),
                posicao: decision.position,
                score: decision.score,
            });
        }

        (ordered, decisions)
    }

    fn check_integrity(
        &self,
        files: &[FileEntryWithAst],
        options: &RunOptions,
    ) -> Result<Option<GuardianReport>, InquisidorError> {
        let Some(guardian) = self.guardian.as_ref().filter(|_| !options.skip_guardian) else {
            return Ok(None);
        };

        let entries: Vec<FileEntry> = files.iter().map(|f| f.entry.clone()).collect();
        match guardian.check(&entries) {
            Ok(report) => Ok(Some(report)),
            Err(GuardianError::Violation(violation)) => Err(violation.into()),
            Err(GuardianError::Storage(e)) => {
                warn!(error = %e, "Guardian baseline unavailable, continuing without it");
                Ok(None)
            }
        }
    }

    fn emit_run_events(&self, report: &RunReport) {
        if !self.events.is_enabled() {
            return;
        }

        for summary in &report.metrics {
            self.events.emit(StructuredEvent::Analista {
                nome: summary.name.clone(),
                duracao_ms: summary.duration_ms,
                ocorrencias: summary.occurrences,
                execucoes: summary.executions,
                global: summary.global,
            });
        }

        self.events.emit(StructuredEvent::Metricas {
            arquivos: report.files_total,
            analisados: report.files_analyzed,
            reaproveitados: report.files_reused,
            ocorrencias: report.occurrences.len(),
            erros: report.total_errors,
            cache_hits: report.cache.hits,
            cache_misses: report.cache.misses,
            parse_ms: report.cache.parse_ms,
            duracao_ms: report.duration_ms,
        });
    }
}

/// Keep the first entry for each relative path
fn unique_by_path<I>(files: I) -> Vec<FileEntry>
where
    I: IntoIterator<Item = FileEntry>,
{
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|f| {
            let fresh = seen.insert(f.rel_path.clone());
            if !fresh {
                warn!(file = %f.rel_path, "Duplicate path in input, keeping the first entry");
            }
            fresh
        })
        .collect()
}

fn merge_occurrences(
    dispatch: &[FileEntryWithAst],
    reused: &HashSet<String>,
    previous: &IncrementalState,
    parse_errors: &[Occurrence],
    outcome: &PoolOutcome,
) -> Vec<Occurrence> {
    let reused_occurrences = dispatch
        .iter()
        .filter(|f| reused.contains(f.rel_path()))
        .filter_map(|f| previous.get(f.rel_path()))
        .flat_map(|state| state.occurrences.iter());

    let mut seen: HashSet<(String, Option<usize>, String, String)> = HashSet::new();
    reused_occurrences
        .chain(parse_errors.iter())
        .chain(outcome.all_occurrences())
        .filter(|o| seen.insert((o.rel_path.clone(), o.line, o.kind.clone(), o.message.clone())))
        .cloned()
        .collect()
}

/// State for the next run.
///
/// Files from abandoned batches get no entry so they are analysed again.
fn next_state(
    dispatch: &[FileEntryWithAst],
    hashes: &HashMap<String, String>,
    reused: &HashSet<String>,
    previous: &IncrementalState,
    parse_errors: &[Occurrence],
    outcome: &PoolOutcome,
) -> IncrementalState {
    let processed: HashSet<&str> = outcome.processed_files.iter().map(String::as_str).collect();

    let mut occurrences: HashMap<&str, Vec<Occurrence>> = HashMap::new();
    for occurrence in parse_errors.iter().chain(outcome.occurrences.iter()) {
        occurrences
            .entry(occurrence.rel_path.as_str())
            .or_default()
            .push(occurrence.clone());
    }

    let mut analysts: HashMap<&str, BTreeMap<String, AnalystFileMetric>> = HashMap::new();
    for metric in &outcome.file_metrics {
        let entry = analysts
            .entry(metric.rel_path.as_str())
            .or_default()
            .entry(metric.technique.clone())
            .or_default();
        entry.occurrences += metric.occurrences;
        entry.duration_ms += metric.duration_ms;
    }

    let mut next = IncrementalState::default();
    for file in dispatch {
        let rel_path = file.rel_path();
        let Some(hash) = hashes.get(rel_path) else {
            continue;
        };

        if reused.contains(rel_path) {
            if let Some(prior) = previous.get(rel_path) {
                let mut state = prior.clone();
                state.reuse_count += 1;
                next.files.insert(rel_path.to_string(), state);
            }
            continue;
        }

        if !processed.contains(rel_path) {
            continue;
        }

        let reuse_count = match previous.get(rel_path) {
            Some(prior) if &prior.hash == hash => prior.reuse_count,
            _ => 0,
        };

        next.files.insert(
            rel_path.to_string(),
            IncrementalFileState {
                hash: hash.clone(),
                occurrences: occurrences.remove(rel_path).unwrap_or_default(),
                analysts: analysts.remove(rel_path).unwrap_or_default(),
                reuse_count,
            },
        );
    }

    next
}
