// Core infrastructure modules
pub mod ast_cache;
pub mod events;
pub mod incremental;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod slots;
pub mod storage;

// Re-exports
pub use ast_cache::{AstCache, AstLookup, CacheStats, ChangeSignature};
pub use events::{EventLog, StructuredEvent};
pub use incremental::{
    prioritize, priority_score, AnalystFileMetric, IncrementalConfig, IncrementalFileState,
    IncrementalState, IncrementalStore, PriorityDecision, PriorityWeights,
};
pub use logging::*;
pub use metrics::{aggregate_metrics, AnalystMetric, AnalystSummary, FileAnalystMetric};
pub use pool::{ExecutionMode, PoolError, PoolOptions, PoolOutcome, WorkerPool, WorkerResult, WorkerTask};
pub use slots::{Slot, Slots};
pub use storage::{FsJsonStore, JsonStore, StorageError};
