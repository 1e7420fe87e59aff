//! AST cache
//!
//! Trees are kept in an in-memory LRU keyed by relative path and validated by a
//! change signature. Signatures persisted from a previous run (the incremental
//! state hashes) also count as hits when the caller is going to reuse that run's
//! results, so an unchanged file is parsed once across consecutive runs.

use crate::core::{FileEntry, SyntaxTree};
use crate::frontend::parser::{ParseError, SourceParser};
use crate::infrastructure::metrics::elapsed_ms;
use crate::infrastructure::slots::Slots;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 512;

/// How a file's "unchanged" status is decided
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeSignature {
    Stat { size: u64, mtime_ms: u128 },
    Hash(String),
}

impl ChangeSignature {
    pub fn hash(hash: impl Into<String>) -> Self {
        Self::Hash(hash.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub parse_ms: f64,
    pub timeouts: u64,
    pub failures: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of resolving one file
#[derive(Debug, Clone)]
pub enum AstLookup {
    /// In-memory hit; the tree may be absent for languages with no parser
    Cached(Option<SyntaxTree>),
    /// Hit on a persisted signature; no tree is available in this process
    Persisted,
    Parsed(Option<SyntaxTree>),
    Failed(ParseError),
}

impl AstLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Cached(_) | Self::Persisted)
    }

    pub fn tree(&self) -> Option<&SyntaxTree> {
        match self {
            Self::Cached(tree) | Self::Parsed(tree) => tree.as_ref(),
            Self::Persisted | Self::Failed(_) => None,
        }
    }
}

struct CachedAst {
    signature: ChangeSignature,
    tree: Option<SyntaxTree>,
}

pub struct AstCache {
    parser: Arc<dyn SourceParser>,
    /// `None` parses inline without a bound
    timeout: Option<Duration>,
    memory: Mutex<LruCache<String, CachedAst>>,
    persisted: Mutex<HashMap<String, ChangeSignature>>,
    stats: Mutex<CacheStats>,
    /// Bounds parse threads, timed-out ones included
    parse_slots: Slots,
}

impl AstCache {
    pub fn new(parser: Arc<dyn SourceParser>, capacity: usize, timeout_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            parser,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            memory: Mutex::new(LruCache::new(capacity)),
            persisted: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            parse_slots: Slots::new(thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
        }
    }

    /// Cap the number of live parse threads
    pub fn with_parse_threads(mut self, threads: usize) -> Self {
        self.parse_slots = Slots::new(threads);
        self
    }

    /// Replace the signatures remembered from a previous run
    pub fn seed_persisted<I>(&self, signatures: I)
    where
        I: IntoIterator<Item = (String, ChangeSignature)>,
    {
        let mut persisted = self.persisted.lock();
        persisted.clear();
        persisted.extend(signatures);
    }

    /// Resolve the tree for `entry`.
    ///
    /// `allow_persisted` lets a matching persisted signature count as a hit; pass
    /// it only when the file's previous results will be reused instead of
    /// re-analysed, since no tree is produced.
    pub fn resolve(&self, entry: &FileEntry, signature: &ChangeSignature, allow_persisted: bool) -> AstLookup {
        if let Some(cached) = self.memory.lock().get(&entry.rel_path) {
            if &cached.signature == signature {
                self.stats.lock().hits += 1;
                return AstLookup::Cached(cached.tree.clone());
            }
        }

        if allow_persisted && self.persisted.lock().get(&entry.rel_path) == Some(signature) {
            self.stats.lock().hits += 1;
            return AstLookup::Persisted;
        }

        let start = Instant::now();
        let result = self.parse_bounded(entry);
        let parse_ms = elapsed_ms(start);

        let mut stats = self.stats.lock();
        stats.misses += 1;
        stats.parse_ms += parse_ms;

        match result {
            Ok(tree) => {
                drop(stats);
                self.memory.lock().put(
                    entry.rel_path.clone(),
                    CachedAst {
                        signature: signature.clone(),
                        tree: tree.clone(),
                    },
                );
                self.persisted.lock().insert(entry.rel_path.clone(), signature.clone());
                AstLookup::Parsed(tree)
            }
            Err(e) => {
                match e {
                    ParseError::Timeout(_) => stats.timeouts += 1,
                    _ => stats.failures += 1,
                }
                drop(stats);
                // A stale tree must not survive a failed re-parse
                self.invalidate(&entry.rel_path);
                debug!(file = %entry.rel_path, error = %e, "Parse failed");
                AstLookup::Failed(e)
            }
        }
    }

    fn parse_bounded(&self, entry: &FileEntry) -> Result<Option<SyntaxTree>, ParseError> {
        let extension = entry.extension();
        let Some(timeout) = self.timeout else {
            return self.parser.parse(&entry.content, &extension);
        };

        let deadline = Instant::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        // Waiting for a thread counts against the same budget
        let Some(slot) = self.parse_slots.acquire_deadline(deadline) else {
            warn!(file = %entry.rel_path, timeout_ms, "No parse thread freed up in time");
            return Err(ParseError::Timeout(timeout_ms));
        };

        let (tx, rx) = crossbeam::channel::bounded(1);
        let parser = Arc::clone(&self.parser);
        let content = Arc::clone(&entry.content);
        let ext = extension.clone();

        let spawned = thread::Builder::new()
            .name(format!("parse:{}", entry.rel_path))
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(parser.parse(&content, &ext));
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Could not spawn parse thread, parsing inline");
            return self.parser.parse(&entry.content, &extension);
        }

        match rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                warn!(file = %entry.rel_path, timeout_ms, "Parse timed out");
                Err(ParseError::Timeout(timeout_ms))
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                Err(ParseError::Disconnected("parser thread exited without a result".into()))
            }
        }
    }

    pub fn invalidate(&self, rel_path: &str) {
        self.memory.lock().pop(rel_path);
        self.persisted.lock().remove(rel_path);
    }

    pub fn clear(&self) {
        self.memory.lock().clear();
        self.persisted.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::PythonParser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingParser {
        calls: AtomicUsize,
    }

    impl SourceParser for CountingParser {
        fn parse(&self, content: &str, extension: &str) -> Result<Option<SyntaxTree>, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PythonParser.parse(content, extension)
        }
    }

    struct SlowParser;

    impl SourceParser for SlowParser {
        fn parse(&self, _content: &str, _extension: &str) -> Result<Option<SyntaxTree>, ParseError> {
            thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }

    fn entry(content: &str) -> FileEntry {
        FileEntry::in_memory("pkg/mod.py", content)
    }

    #[test]
    fn test_hit_on_same_signature() {
        let parser = Arc::new(CountingParser {
            calls: AtomicUsize::new(0),
        });
        let cache = AstCache::new(parser.clone(), 8, 1_000);
        let file = entry("x = 1\n");
        let sig = ChangeSignature::hash("h1");

        let first = cache.resolve(&file, &sig, false);
        let second = cache.resolve(&file, &sig, false);

        assert!(matches!(first, AstLookup::Parsed(Some(_))));
        assert!(second.is_hit());
        assert!(first.tree().unwrap().ptr_eq(second.tree().unwrap()));
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_changed_signature_reparses() {
        let cache = AstCache::new(Arc::new(PythonParser), 8, 0);
        let file = entry("x = 1\n");
        cache.resolve(&file, &ChangeSignature::hash("h1"), false);
        let lookup = cache.resolve(&file, &ChangeSignature::hash("h2"), false);

        assert!(matches!(lookup, AstLookup::Parsed(_)));
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_persisted_signature_counts_as_hit_only_when_allowed() {
        let cache = AstCache::new(Arc::new(PythonParser), 8, 0);
        cache.seed_persisted([("pkg/mod.py".to_string(), ChangeSignature::hash("h1"))]);
        let file = entry("x = 1\n");

        assert!(matches!(
            cache.resolve(&file, &ChangeSignature::hash("h1"), true),
            AstLookup::Persisted
        ));
        assert_eq!(cache.stats().hits, 1);

        cache.clear();
        cache.seed_persisted([("pkg/mod.py".to_string(), ChangeSignature::hash("h1"))]);
        assert!(matches!(
            cache.resolve(&file, &ChangeSignature::hash("h1"), false),
            AstLookup::Parsed(_)
        ));
    }

    #[test]
    fn test_syntax_error_is_failure() {
        let cache = AstCache::new(Arc::new(PythonParser), 8, 1_000);
        let lookup = cache.resolve(&entry("def broken(:\n"), &ChangeSignature::hash("h"), false);

        assert!(matches!(lookup, AstLookup::Failed(ParseError::Syntax(_))));
        assert_eq!(cache.stats().failures, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_timeout_degrades() {
        let cache = AstCache::new(Arc::new(SlowParser), 8, 20);
        let lookup = cache.resolve(&entry("x = 1\n"), &ChangeSignature::hash("h"), false);

        assert!(matches!(lookup, AstLookup::Failed(ParseError::Timeout(20))));
        assert_eq!(cache.stats().timeouts, 1);
    }

    #[test]
    fn test_timed_out_parses_hold_their_thread() {
        struct SlowCounting(AtomicUsize);
        impl SourceParser for SlowCounting {
            fn parse(&self, _content: &str, _extension: &str) -> Result<Option<SyntaxTree>, ParseError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(500));
                Ok(None)
            }
        }

        let parser = Arc::new(SlowCounting(AtomicUsize::new(0)));
        let cache = AstCache::new(parser.clone(), 8, 30).with_parse_threads(1);
        let sig = ChangeSignature::hash("h");

        let first = cache.resolve(&FileEntry::in_memory("a.py", "a = 1\n"), &sig, false);
        let second = cache.resolve(&FileEntry::in_memory("b.py", "b = 1\n"), &sig, false);
        thread::sleep(Duration::from_millis(100));

        assert!(matches!(first, AstLookup::Failed(ParseError::Timeout(30))));
        assert!(matches!(second, AstLookup::Failed(ParseError::Timeout(30))));
        assert_eq!(parser.0.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().timeouts, 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = AstCache::new(Arc::new(PythonParser), 1, 0);
        let sig = ChangeSignature::hash("h");
        cache.resolve(&FileEntry::in_memory("a.py", "a = 1\n"), &sig, false);
        cache.resolve(&FileEntry::in_memory("b.py", "b = 1\n"), &sig, false);

        assert_eq!(cache.len(), 1);
        assert!(matches!(
            cache.resolve(&FileEntry::in_memory("a.py", "a = 1\n"), &sig, false),
            AstLookup::Parsed(_)
        ));
    }
}
