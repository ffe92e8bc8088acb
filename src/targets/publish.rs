use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("target publish I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("target serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger read failed: {0}")]
    Ledger(#[from] crate::persistence::LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Written { digest: String },
    Unchanged { digest: String },
}

impl PublishOutcome {
    pub fn digest(&self) -> &str {
        match self {
            PublishOutcome::Written { digest } | PublishOutcome::Unchanged { digest } => digest,
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, PublishOutcome::Written { .. })
    }
}

pub fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Replaces `path` with `payload` through a staged sibling file and a rename,
/// so a concurrent reader sees either the old or the new document in full.
/// Skips the write when the file already holds identical bytes.
pub fn publish_atomic(path: &Path, payload: &[u8]) -> Result<PublishOutcome, PublishError> {
    let digest = payload_digest(payload);
    match fs::read(path) {
        Ok(current) if payload_digest(&current) == digest => {
            return Ok(PublishOutcome::Unchanged { digest });
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(PublishError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let io_err = |source: io::Error| PublishError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    swap_in(path, &staging_path(path), payload).map_err(io_err)?;
    #[cfg(unix)]
    if let Some(parent) = parent {
        // Persist the rename itself.
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(PublishOutcome::Written { digest })
}

/// Writes `staging`, syncs it and renames it over `path`. The staging file is
/// removed on every failure.
fn swap_in(path: &Path, staging: &Path, payload: &[u8]) -> io::Result<()> {
    let outcome = write_staged(staging, payload).and_then(|()| fs::rename(staging, path));
    if outcome.is_err() {
        let _ = fs::remove_file(staging);
    }
    outcome
}

fn write_staged(staging: &Path, payload: &[u8]) -> io::Result<()> {
    let mut staged = fs::File::create(staging)?;
    staged.write_all(payload)?;
    staged.sync_all()
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "targets".to_string());
    path.with_file_name(format!(".{name}.{}.staging", std::process::id()))
}
