//! Inquisidor - parallel, incremental, tamper-evident static analysis
//!
//! The crate is organized by concern: the shared data model lives in `core`,
//! pluggable analysis routines in `analysis`, the integrity engine in
//! `guardian`, caching/pooling/incremental state in `infrastructure`, and the
//! external collaborators (parser, scanner, configuration) in `frontend`.

pub mod core;
pub mod analysis;
pub mod guardian;
pub mod infrastructure;
pub mod frontend;
pub mod inquisidor;

// Re-export commonly used items
pub use self::core::{FileEntry, FileEntryWithAst, Level, Occurrence, SyntaxTree};
pub use analysis::{
    AnalysisContext, FileTechnique, GlobalTechnique, RunAccumulator, Technique, TechniqueError,
};
pub use guardian::{
    Guardian, GuardianConfig, GuardianError, GuardianReport, GuardianStatus, IntegrityViolation,
    HashAlgorithm, HashEngine, Snapshot, SnapshotDiff,
};
pub use infrastructure::{
    AnalystMetric, AnalystSummary, AstCache, CacheStats, EventLog, IncrementalFileState,
    IncrementalState, PoolOptions, PoolOutcome, PriorityWeights, StructuredEvent, WorkerPool,
    init_logging, LogConfig, LogFormat, LogOutput,
};
pub use frontend::{scan, Config, PythonParser, SourceParser};
pub use inquisidor::{Inquisidor, InquisidorError, RunOptions, RunReport};
