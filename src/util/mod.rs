//! Shared helpers: error taxonomy, retry policy, named locks, cancellation.

pub mod cancel;
pub mod error;
pub mod locks;
pub mod retry;

pub use cancel::CancellationToken;
pub use error::{ConsistencyError, ControlPlaneError, EntityKind};
pub use locks::{NamedGuard, NamedLocks};
pub use retry::{RetryHandle, RetryPolicy};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub(crate) fn system_time_to_ms(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

/// If `path` is relative, joins it to `base`; otherwise returns it unchanged.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}
