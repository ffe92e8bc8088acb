//! Ledger Store: the single persistence authority for node and cluster state.

mod file;
mod ledger;
mod memory;

pub use file::FileLedger;
pub use ledger::{
    Claim, FormationLease, LedgerError, LedgerKey, LedgerSnapshot, LedgerStore, LedgerTxn, Precondition,
    Versioned,
};
pub use memory::InMemoryLedger;
