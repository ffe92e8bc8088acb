use super::ledger::{LedgerError, LedgerSnapshot, LedgerStore, LedgerTxn};
use parking_lot::RwLock;
use std::sync::Arc;

/// Volatile ledger; snapshots are shared `Arc`s swapped on every commit.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<Arc<LedgerSnapshot>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: RwLock::new(Arc::new(snapshot)),
        }
    }
}

impl LedgerStore for InMemoryLedger {
    fn snapshot(&self) -> Result<Arc<LedgerSnapshot>, LedgerError> {
        Ok(self.state.read().clone())
    }

    fn commit(&self, txn: LedgerTxn) -> Result<u64, LedgerError> {
        let mut state = self.state.write();
        let next = state.apply(txn)?;
        let revision = next.revision;
        *state = Arc::new(next);
        Ok(revision)
    }
}
