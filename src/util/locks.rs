use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

const PRUNE_THRESHOLD: usize = 1024;

/// Guard returned by [`NamedLocks::lock`]; the name stays locked until it is dropped.
pub type NamedGuard = ArcMutexGuard<RawMutex, ()>;

/// Table of per-name mutexes. Entries are created on first use and pruned once
/// nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct NamedLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, name: &str) -> NamedGuard {
        let entry = self.entry(name);
        entry.lock_arc()
    }

    pub fn try_lock(&self, name: &str) -> Option<NamedGuard> {
        let entry = self.entry(name);
        entry.try_lock_arc()
    }

    /// Locks every name in sorted order so overlapping callers cannot deadlock.
    pub fn lock_all<'a, I>(&self, names: I) -> Vec<NamedGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sorted: Vec<&str> = names.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|name| self.lock(name)).collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        let mut table = self.table.lock();
        if table.len() >= PRUNE_THRESHOLD {
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
