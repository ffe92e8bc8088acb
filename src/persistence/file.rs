use super::ledger::{FormationLease, LedgerError, LedgerSnapshot, LedgerStore, LedgerTxn};
use fs2::FileExt;
use log::{debug, info};
use parking_lot::RwLock;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ledger persisted as a single JSON document shared by every process that
/// opens the same path.
///
/// Commits take an exclusive advisory lock on `<path>.lock`, re-read the
/// document and check preconditions against the on-disk revision, then write
/// the successor to a sibling temp file, sync it and rename it into place.
/// A failed write leaves both disk and memory at the prior revision.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lease_path: PathBuf,
    tmp_path: PathBuf,
    state: RwLock<Arc<LedgerSnapshot>>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let snapshot = read_document(&path)?.unwrap_or_default();
        info!(
            "event=ledger_open path={} revision={}",
            path.display(),
            snapshot.revision
        );
        Ok(Self {
            lock_path: sibling(&path, ".lock"),
            lease_path: sibling(&path, ".formations"),
            tmp_path: sibling(&path, ".tmp"),
            path,
            state: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self, path: &Path) -> Result<File, LedgerError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    /// Returns the newer of the cached and on-disk documents, caching the
    /// latter when another handle has committed since.
    fn refresh(&self) -> Result<Arc<LedgerSnapshot>, LedgerError> {
        let on_disk = read_document(&self.path)?;
        let mut state = self.state.write();
        match on_disk {
            Some(doc) if doc.revision > state.revision => {
                debug!(
                    "event=ledger_reload path={} from={} to={}",
                    self.path.display(),
                    state.revision,
                    doc.revision
                );
                *state = Arc::new(doc);
            }
            _ => {}
        }
        Ok(state.clone())
    }

    fn persist(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        let payload = serde_json::to_vec_pretty(snapshot)?;
        let written = File::create(&self.tmp_path).and_then(|mut tmp_file| {
            tmp_file.write_all(&payload)?;
            tmp_file.sync_all()?;
            fs::rename(&self.tmp_path, &self.path)
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(LedgerError::Io(err));
        }
        debug!(
            "event=ledger_persist path={} revision={} bytes={}",
            self.path.display(),
            snapshot.revision,
            payload.len()
        );
        Ok(())
    }
}

impl LedgerStore for FileLedger {
    fn snapshot(&self) -> Result<Arc<LedgerSnapshot>, LedgerError> {
        self.refresh()
    }

    fn commit(&self, txn: LedgerTxn) -> Result<u64, LedgerError> {
        let lock = self.open_lock(&self.lock_path)?;
        lock.lock_exclusive()?;
        let current = self.refresh()?;
        let next = current.apply(txn)?;
        self.persist(&next)?;
        let revision = next.revision;
        *self.state.write() = Arc::new(next);
        // Closing the handle releases the lock.
        drop(lock);
        Ok(revision)
    }

    fn formation_lease(&self) -> Result<FormationLease, LedgerError> {
        let file = self.open_lock(&self.lease_path)?;
        file.lock_shared()?;
        Ok(FormationLease::held(file))
    }

    fn try_recovery_lease(&self) -> Result<Option<FormationLease>, LedgerError> {
        let file = self.open_lock(&self.lease_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FormationLease::held(file))),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(LedgerError::Io(err)),
        }
    }
}

fn read_document(path: &Path) -> Result<Option<LedgerSnapshot>, LedgerError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LedgerError::Io(err)),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
