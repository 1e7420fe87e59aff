//! Snapshot diffing with process-wide memoization
//!
//! Repeated comparisons of the same pair of snapshots within one process return
//! the same `Arc<SnapshotDiff>`.

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

/// relPath -> content hash
pub type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub changed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.removed.len() + self.added.len() + self.changed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DiffKey {
    before_len: usize,
    after_len: usize,
    protected: bool,
    before_fingerprint: u64,
    after_fingerprint: u64,
}

impl DiffKey {
    fn new(before: &Snapshot, after: &Snapshot, protected: bool) -> Self {
        Self {
            before_len: before.len(),
            after_len: after.len(),
            protected,
            before_fingerprint: fingerprint(before),
            after_fingerprint: fingerprint(after),
        }
    }
}

fn fingerprint(snapshot: &Snapshot) -> u64 {
    let mut hasher = DefaultHasher::new();
    snapshot.hash(&mut hasher);
    hasher.finish()
}

const MEMO_CAPACITY: usize = 64;

static DIFF_MEMO: Lazy<Mutex<LruCache<DiffKey, Arc<SnapshotDiff>>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(capacity))
});

/// Uncached diff. Output order follows the source map's iteration order.
pub fn compute_diff(before: &Snapshot, after: &Snapshot) -> SnapshotDiff {
    let removed = before
        .keys()
        .filter(|path| !after.contains_key(*path))
        .cloned()
        .collect();
    let added = after
        .keys()
        .filter(|path| !before.contains_key(*path))
        .cloned()
        .collect();
    let changed = after
        .iter()
        .filter(|(path, hash)| before.get(*path).is_some_and(|old| old != *hash))
        .map(|(path, _)| path.clone())
        .collect();

    SnapshotDiff { removed, added, changed }
}

/// Memoized diff in unprotected mode
pub fn diff(before: &Snapshot, after: &Snapshot) -> Arc<SnapshotDiff> {
    diff_with_mode(before, after, false)
}

/// Memoized diff; `protected` is part of the memo key
pub fn diff_with_mode(before: &Snapshot, after: &Snapshot, protected: bool) -> Arc<SnapshotDiff> {
    let key = DiffKey::new(before, after, protected);

    if let Some(hit) = DIFF_MEMO.lock().get(&key) {
        trace!(before = key.before_len, after = key.after_len, "Snapshot diff memo hit");
        return hit.clone();
    }

    let computed = Arc::new(compute_diff(before, after));
    DIFF_MEMO.lock().put(key, computed.clone());
    computed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(pairs: &[(&str, &str)]) -> Snapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_added_removed_changed() {
        let before = snapshot(&[("a", "1"), ("b", "2")]);
        let after = snapshot(&[("b", "2"), ("c", "3")]);

        let d = compute_diff(&before, &after);
        assert_eq!(d.removed, vec!["a"]);
        assert_eq!(d.added, vec!["c"]);
        assert!(d.changed.is_empty());
    }

    #[test]
    fn test_changed_hash() {
        let before = snapshot(&[("a", "1"), ("b", "2")]);
        let after = snapshot(&[("a", "1"), ("b", "9")]);

        let d = compute_diff(&before, &after);
        assert_eq!(d.changed, vec!["b"]);
        assert_eq!(d.total(), 1);
    }

    #[test]
    fn test_memo_returns_same_object() {
        let before = snapshot(&[("memo/a", "1"), ("memo/b", "2")]);
        let after = snapshot(&[("memo/b", "2"), ("memo/c", "3")]);
        let other = snapshot(&[("memo/x", "1")]);

        let first = diff(&before, &after);
        let second = diff(&before, &after);
        assert!(Arc::ptr_eq(&first, &second));

        let third = diff(&before, &other);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_equal_sized_snapshots_do_not_alias() {
        let before = snapshot(&[("alias/a", "1")]);
        let after_one = snapshot(&[("alias/a", "2")]);
        let after_two = snapshot(&[("alias/b", "1")]);

        assert_eq!(diff(&before, &after_one).changed, vec!["alias/a"]);
        assert_eq!(diff(&before, &after_two).added, vec!["alias/b"]);
    }

    #[test]
    fn test_protection_flag_is_part_of_key() {
        let before = snapshot(&[("flag/a", "1")]);
        let after = snapshot(&[("flag/a", "2")]);

        let open = diff_with_mode(&before, &after, false);
        let protected = diff_with_mode(&before, &after, true);
        assert!(!Arc::ptr_eq(&open, &protected));
        assert_eq!(*open, *protected);
    }

    proptest! {
        #[test]
        fn prop_self_diff_is_empty(entries in proptest::collection::btree_map("[a-z/]{1,12}", "[0-9a-f]{8}", 0..32)) {
            prop_assert!(compute_diff(&entries, &entries).is_empty());
            prop_assert!(diff(&entries, &entries).is_empty());
        }
    }
}
