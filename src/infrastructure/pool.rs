//! Worker pool
//!
//! Files are split into fixed-size batches and each batch runs on its own worker
//! thread. A worker holds one of `max_workers` slots until its thread exits, so
//! abandoned workers still count against the limit. Each worker gets its own
//! task and result channel; the supervisor selects over the result channels of
//! every batch in flight with a deadline per batch. A batch that overruns its
//! deadline is recorded as an error, told to stop via its cancel flag, and
//! abandoned. A batch that waits longer than the timeout for a slot held only by
//! abandoned workers is reported as stalled. Results are folded in batch order
//! so output does not depend on completion order.
//!
//! Global techniques run once on the calling thread after every batch settles.

use crate::analysis::{AnalysisContext, FileTechnique, GlobalTechnique, RunAccumulator, Technique};
use crate::core::{FileEntryWithAst, Occurrence};
use crate::infrastructure::metrics::{elapsed_ms, AnalystMetric, FileAnalystMetric};
use crate::infrastructure::slots::{Slot, Slots};
use crossbeam::channel::{bounded, Receiver, Select, Sender};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// `false` runs every batch inline on the calling thread
    pub enabled: bool,
    /// 0 = one per available core
    pub max_workers: usize,
    pub batch_size: usize,
    /// Per-batch bound; 0 disables it
    pub timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 0,
            batch_size: 10,
            timeout_ms: 30_000,
        }
    }
}

impl PoolOptions {
    pub fn worker_count(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("batch {batch_index} on worker {worker_id} timed out after {timeout_ms} ms")]
    Timeout {
        batch_index: usize,
        worker_id: usize,
        timeout_ms: u64,
    },

    #[error("batch {batch_index} on worker {worker_id} failed: {message}")]
    Failed {
        batch_index: usize,
        worker_id: usize,
        message: String,
    },

    #[error("batch {batch_index} on worker {worker_id} ended without reporting")]
    Disconnected { batch_index: usize, worker_id: usize },

    #[error("batch {batch_index} not started: no worker freed up within {timeout_ms} ms")]
    Stalled { batch_index: usize, timeout_ms: u64 },
}

impl PoolError {
    pub fn batch_index(&self) -> usize {
        match self {
            Self::Timeout { batch_index, .. }
            | Self::Failed { batch_index, .. }
            | Self::Disconnected { batch_index, .. }
            | Self::Stalled { batch_index, .. } => *batch_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Concurrent,
    Sequential,
}

/// One batch of files and the techniques to run over them
#[derive(Clone)]
pub struct WorkerTask {
    pub worker_id: usize,
    pub batch_index: usize,
    pub files: Vec<FileEntryWithAst>,
    pub techniques: Arc<[Arc<dyn FileTechnique>]>,
    pub context: AnalysisContext,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub batch_index: usize,
    pub occurrences: Vec<Occurrence>,
    pub metrics: Vec<AnalystMetric>,
    pub file_metrics: Vec<FileAnalystMetric>,
    pub processed_files: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: f64,
    pub cancelled: bool,
}

impl WorkerTask {
    /// Run every applicable technique over every file in the batch.
    ///
    /// The cancel flag is checked before each technique; a cancelled batch
    /// stops without reporting the file it was on. A technique error becomes an error occurrence for that file and an entry
    /// in the error list; the remaining techniques and files still run.
    pub fn run(&self) -> WorkerResult {
        let start = Instant::now();
        let mut result = WorkerResult {
            worker_id: self.worker_id,
            batch_index: self.batch_index,
            ..WorkerResult::default()
        };

        'files: for file in &self.files {
            let rel_path = file.rel_path();
            for technique in self.techniques.iter() {
                if self.cancel.load(Ordering::Relaxed) {
                    result.cancelled = true;
                    break 'files;
                }
                if !technique.applies_to(rel_path) || (technique.requires_ast() && file.ast.is_none()) {
                    continue;
                }

                let technique_start = Instant::now();
                let outcome = technique.apply(file, &self.context);
                let duration = technique_start.elapsed();

                let found = match outcome {
                    Ok(occurrences) => occurrences,
                    Err(e) => {
                        result.errors.push(format!("{}: {}", rel_path, e));
                        vec![Occurrence::technique_error(rel_path, technique.name(), &e)]
                    }
                };

                result
                    .metrics
                    .push(AnalystMetric::new(technique.name(), duration, found.len(), false));
                result.file_metrics.push(FileAnalystMetric {
                    rel_path: rel_path.to_string(),
                    technique: technique.name().to_string(),
                    duration_ms: duration.as_secs_f64() * 1000.0,
                    occurrences: found.len(),
                });
                result.occurrences.extend(found);
            }
            result.processed_files.push(rel_path.to_string());
        }

        result.duration_ms = elapsed_ms(start);
        result
    }
}

#[derive(Debug, Clone)]
pub struct PoolOutcome {
    /// Per-file occurrences, in batch order
    pub occurrences: Vec<Occurrence>,
    /// Occurrences from global techniques
    pub global_occurrences: Vec<Occurrence>,
    pub metrics: Vec<AnalystMetric>,
    pub file_metrics: Vec<FileAnalystMetric>,
    pub processed_files: Vec<String>,
    pub total_processed: usize,
    pub total_errors: usize,
    pub errors: Vec<PoolError>,
    pub technique_errors: Vec<String>,
    pub batches: usize,
    pub mode: ExecutionMode,
}

impl PoolOutcome {
    fn new(mode: ExecutionMode, batches: usize) -> Self {
        Self {
            occurrences: Vec::new(),
            global_occurrences: Vec::new(),
            metrics: Vec::new(),
            file_metrics: Vec::new(),
            processed_files: Vec::new(),
            total_processed: 0,
            total_errors: 0,
            errors: Vec::new(),
            technique_errors: Vec::new(),
            batches,
            mode,
        }
    }

    /// Per-file then global occurrences
    pub fn all_occurrences(&self) -> impl Iterator<Item = &Occurrence> {
        self.occurrences.iter().chain(self.global_occurrences.iter())
    }

    fn absorb(&mut self, batch: BatchOutcome) {
        match batch {
            BatchOutcome::Done(result) => {
                self.total_processed += result.processed_files.len();
                self.total_errors += result.errors.len();
                self.occurrences.extend(result.occurrences);
                self.metrics.extend(result.metrics);
                self.file_metrics.extend(result.file_metrics);
                self.processed_files.extend(result.processed_files);
                self.technique_errors.extend(result.errors);
            }
            BatchOutcome::Error(e) => {
                self.total_errors += 1;
                self.errors.push(e);
            }
        }
    }
}

enum BatchOutcome {
    Done(WorkerResult),
    Error(PoolError),
}

enum WorkerMessage {
    Done(WorkerResult),
    Panicked {
        worker_id: usize,
        batch_index: usize,
        message: String,
    },
}

impl WorkerMessage {
    fn into_outcome(self) -> BatchOutcome {
        match self {
            Self::Done(result) => BatchOutcome::Done(result),
            Self::Panicked {
                worker_id,
                batch_index,
                message,
            } => BatchOutcome::Error(PoolError::Failed {
                batch_index,
                worker_id,
                message,
            }),
        }
    }
}

enum Signal {
    SlotFreed(Option<usize>),
    Settled(usize, Option<WorkerMessage>),
    Deadline,
}

struct InFlight {
    worker_id: usize,
    batch_index: usize,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
    results: Receiver<WorkerMessage>,
}

pub struct WorkerPool {
    options: PoolOptions,
    /// One token per live worker thread, abandoned ones included
    slots: Slots,
}

impl WorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        let slots = Slots::new(options.worker_count());
        Self { options, slots }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Run `techniques` over `files`.
    ///
    /// Per-file techniques run in batches; global techniques run once afterwards
    /// with `accumulator` as their shared cross-file state.
    #[instrument(skip_all, fields(files = files.len(), enabled = self.options.enabled))]
    pub fn process_files(
        &self,
        files: Vec<FileEntryWithAst>,
        techniques: &[Technique],
        context: &AnalysisContext,
        accumulator: &mut RunAccumulator,
    ) -> PoolOutcome {
        let file_techniques: Arc<[Arc<dyn FileTechnique>]> = techniques
            .iter()
            .filter_map(|t| match t {
                Technique::File(t) => Some(Arc::clone(t)),
                Technique::Global(_) => None,
            })
            .collect();

        let batches = split_batches(files, self.options.batch_size);
        let batch_count = batches.len();

        let (mode, outcomes) = if self.options.enabled {
            (
                ExecutionMode::Concurrent,
                self.run_concurrent(batches, &file_techniques, context),
            )
        } else {
            (
                ExecutionMode::Sequential,
                self.run_sequential(batches, &file_techniques, context),
            )
        };

        let mut outcome = PoolOutcome::new(mode, batch_count);
        for batch in outcomes {
            outcome.absorb(batch);
        }

        for technique in techniques {
            if let Technique::Global(global) = technique {
                self.run_global(global.as_ref(), context, accumulator, &mut outcome);
            }
        }

        info!(
            processed = outcome.total_processed,
            errors = outcome.total_errors,
            batches = batch_count,
            "Pool finished"
        );
        outcome
    }

    fn task(
        &self,
        worker_id: usize,
        batch_index: usize,
        files: Vec<FileEntryWithAst>,
        techniques: &Arc<[Arc<dyn FileTechnique>]>,
        context: &AnalysisContext,
    ) -> WorkerTask {
        WorkerTask {
            worker_id,
            batch_index,
            files,
            techniques: Arc::clone(techniques),
            context: context.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run_sequential(
        &self,
        batches: Vec<Vec<FileEntryWithAst>>,
        techniques: &Arc<[Arc<dyn FileTechnique>]>,
        context: &AnalysisContext,
    ) -> Vec<BatchOutcome> {
        debug!(batches = batches.len(), "Running batches sequentially");
        batches
            .into_iter()
            .enumerate()
            .map(|(batch_index, files)| {
                let task = self.task(0, batch_index, files, techniques, context);
                let outcome = run_caught(&task).into_outcome();

                // Inline batches cannot be interrupted; an overrun is only reported
                if let (Some(timeout), BatchOutcome::Done(result)) = (self.options.timeout(), &outcome) {
                    if result.duration_ms > timeout.as_secs_f64() * 1000.0 {
                        warn!(batch_index, duration_ms = result.duration_ms, "Batch exceeded timeout");
                    }
                }
                outcome
            })
            .collect()
    }

    fn run_concurrent(
        &self,
        batches: Vec<Vec<FileEntryWithAst>>,
        techniques: &Arc<[Arc<dyn FileTechnique>]>,
        context: &AnalysisContext,
    ) -> Vec<BatchOutcome> {
        let total = batches.len();
        let timeout = self.options.timeout();
        debug!(
            batches = total,
            workers = self.slots.capacity(),
            free = self.slots.available(),
            "Dispatching batches"
        );

        let mut outcomes: Vec<Option<BatchOutcome>> = (0..total).map(|_| None).collect();
        let mut pending = batches.into_iter().enumerate().peekable();
        let mut in_flight: Vec<InFlight> = Vec::with_capacity(self.slots.capacity());
        // Set while every slot is held by an abandoned worker
        let mut stall_deadline: Option<Instant> = None;

        loop {
            while pending.peek().is_some() {
                let Some(slot) = self.slots.try_acquire() else {
                    break;
                };
                if let Some((batch_index, files)) = pending.next() {
                    self.dispatch(slot, batch_index, files, techniques, context, &mut in_flight, &mut outcomes);
                }
            }

            if pending.peek().is_none() && in_flight.is_empty() {
                break;
            }

            stall_deadline = if in_flight.is_empty() {
                stall_deadline.or_else(|| timeout.map(|t| Instant::now() + t))
            } else {
                None
            };
            let next_deadline = in_flight.iter().filter_map(|u| u.deadline).chain(stall_deadline).min();

            let signal = {
                let mut select = Select::new();
                for unit in &in_flight {
                    select.recv(&unit.results);
                }
                let slot_index = pending.peek().is_some().then(|| select.recv(self.slots.receiver()));

                let operation = match next_deadline {
                    Some(deadline) => select.select_deadline(deadline).ok(),
                    None => Some(select.select()),
                };
                match operation {
                    None => Signal::Deadline,
                    Some(op) if Some(op.index()) == slot_index => {
                        Signal::SlotFreed(op.recv(self.slots.receiver()).ok())
                    }
                    Some(op) => {
                        let index = op.index();
                        let received = op.recv(&in_flight[index].results);
                        Signal::Settled(index, received.ok())
                    }
                }
            };

            match signal {
                Signal::SlotFreed(Some(id)) => {
                    let slot = self.slots.claim(id);
                    if let Some((batch_index, files)) = pending.next() {
                        self.dispatch(slot, batch_index, files, techniques, context, &mut in_flight, &mut outcomes);
                    }
                }
                Signal::SlotFreed(None) => {}
                Signal::Settled(index, received) => {
                    let unit = in_flight.swap_remove(index);
                    outcomes[unit.batch_index] = Some(match received {
                        Some(message) => {
                            debug!(batch_index = unit.batch_index, worker_id = unit.worker_id, "Batch settled");
                            message.into_outcome()
                        }
                        None => BatchOutcome::Error(PoolError::Disconnected {
                            batch_index: unit.batch_index,
                            worker_id: unit.worker_id,
                        }),
                    });
                }
                Signal::Deadline => {
                    let now = Instant::now();
                    let (expired, live): (Vec<InFlight>, Vec<InFlight>) = in_flight
                        .into_iter()
                        .partition(|unit| unit.deadline.is_some_and(|d| d <= now));
                    in_flight = live;

                    // The worker keeps its slot until its thread exits
                    for unit in expired {
                        unit.cancel.store(true, Ordering::Relaxed);
                        let error = PoolError::Timeout {
                            batch_index: unit.batch_index,
                            worker_id: unit.worker_id,
                            timeout_ms: self.options.timeout_ms,
                        };
                        warn!(%error, "Abandoning batch");
                        outcomes[unit.batch_index] = Some(BatchOutcome::Error(error));
                    }

                    if in_flight.is_empty() && stall_deadline.is_some_and(|d| d <= now) {
                        for (batch_index, _) in pending.by_ref() {
                            let error = PoolError::Stalled {
                                batch_index,
                                timeout_ms: self.options.timeout_ms,
                            };
                            warn!(%error, "Giving up on batch");
                            outcomes[batch_index] = Some(BatchOutcome::Error(error));
                        }
                    }
                }
            }
        }

        outcomes.into_iter().flatten().collect()
    }

    /// Start `files` on a worker holding `slot`, or run them inline if no
    /// thread can be started
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        slot: Slot,
        batch_index: usize,
        files: Vec<FileEntryWithAst>,
        techniques: &Arc<[Arc<dyn FileTechnique>]>,
        context: &AnalysisContext,
        in_flight: &mut Vec<InFlight>,
        outcomes: &mut [Option<BatchOutcome>],
    ) {
        let worker_id = slot.id();
        let task = Arc::new(self.task(worker_id, batch_index, files, techniques, context));

        let results = match spawn_worker(slot) {
            Ok((tasks, results)) => tasks.send(Arc::clone(&task)).ok().map(|_| results),
            Err(e) => {
                warn!(error = %e, batch_index, "Could not spawn worker");
                None
            }
        };

        match results {
            Some(results) => in_flight.push(InFlight {
                worker_id,
                batch_index,
                deadline: self.options.timeout().map(|t| Instant::now() + t),
                cancel: Arc::clone(&task.cancel),
                results,
            }),
            None => {
                warn!(batch_index, "Running batch inline");
                outcomes[batch_index] = Some(run_caught(&task).into_outcome());
            }
        }
    }

    fn run_global(
        &self,
        technique: &dyn GlobalTechnique,
        context: &AnalysisContext,
        accumulator: &mut RunAccumulator,
        outcome: &mut PoolOutcome,
    ) {
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| technique.apply(context, accumulator)));
        let duration = start.elapsed();

        let found = match result {
            Ok(Ok(occurrences)) => occurrences,
            Ok(Err(e)) => {
                outcome.total_errors += 1;
                outcome.technique_errors.push(e.to_string());
                vec![Occurrence::technique_error("", technique.name(), &e)]
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                outcome.total_errors += 1;
                outcome.technique_errors.push(format!("{}: {}", technique.name(), message));
                vec![Occurrence::technique_error("", technique.name(), &message)]
            }
        };

        outcome
            .metrics
            .push(AnalystMetric::new(technique.name(), duration, found.len(), true));
        outcome.global_occurrences.extend(found);
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

fn split_batches(files: Vec<FileEntryWithAst>, batch_size: usize) -> Vec<Vec<FileEntryWithAst>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(files.len().div_ceil(batch_size));
    let mut iter = files.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// Start a worker thread with its own task and result channels.
///
/// The thread owns `slot` and releases it on exit, even after being abandoned.
fn spawn_worker(slot: Slot) -> std::io::Result<(Sender<Arc<WorkerTask>>, Receiver<WorkerMessage>)> {
    let (task_tx, task_rx) = bounded::<Arc<WorkerTask>>(1);
    let (result_tx, result_rx) = bounded::<WorkerMessage>(1);
    thread::Builder::new()
        .name(format!("inquisidor-worker-{}", slot.id()))
        .spawn(move || {
            let _slot = slot;
            if let Ok(task) = task_rx.recv() {
                let _ = result_tx.send(run_caught(&task));
            }
        })?;
    Ok((task_tx, result_rx))
}

fn run_caught(task: &WorkerTask) -> WorkerMessage {
    match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(result) => WorkerMessage::Done(result),
        Err(payload) => WorkerMessage::Panicked {
            worker_id: task.worker_id,
            batch_index: task.batch_index,
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
