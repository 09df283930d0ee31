use std::collections::HashMap;
use std::sync::Arc;

use super::Version;

/// Commits seen during one scan, keyed by order.
///
/// Entries may arrive out of order (the scanner prefetches the lookahead
/// window) and are never evicted for the lifetime of the cache.
#[derive(Debug, Default)]
pub struct CommitFeedCache {
    versions: HashMap<i64, Arc<Version>>,
}

impl CommitFeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version. An order that is already cached keeps its first
    /// entry; returns false in that case.
    pub fn insert(&mut self, version: Version) -> bool {
        if self.versions.contains_key(&version.order) {
            return false;
        }
        self.versions.insert(version.order, Arc::new(version));
        true
    }

    pub fn get(&self, order: i64) -> Option<&Arc<Version>> {
        self.versions.get(&order)
    }

    /// Owned handle, for use after the cache lock is released.
    pub fn get_arc(&self, order: i64) -> Option<Arc<Version>> {
        self.versions.get(&order).cloned()
    }

    pub fn contains(&self, order: i64) -> bool {
        self.versions.contains_key(&order)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
