//! Target Generator: derives scrape-target files from the active node set.

mod publish;
mod render;
mod worker;

pub use publish::{payload_digest, publish_atomic, PublishError, PublishOutcome};
pub use render::{render, target_groups, PortSelector, TargetFile, TargetGroup, ALIAS_LABEL};
pub use worker::{RefreshHandle, RefreshSignal, RefreshWorker};

use crate::persistence::LedgerStore;
use crate::telemetry::MetricsRegistry;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub revision: u64,
    pub node_count: usize,
    pub files: Vec<(PathBuf, PublishOutcome)>,
}

pub struct TargetGenerator {
    ledger: Arc<dyn LedgerStore>,
    files: Vec<TargetFile>,
    metrics: MetricsRegistry,
    // Single writer: the snapshot is taken under this lock so a slower refresh
    // can never publish an older view over a newer one.
    publish_lock: Mutex<()>,
}

impl TargetGenerator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        files: Vec<TargetFile>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            ledger,
            files,
            metrics,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn files(&self) -> &[TargetFile] {
        &self.files
    }

    /// Re-renders every target file from one consistent ledger snapshot.
    pub fn refresh(&self) -> Result<RefreshReport, PublishError> {
        let _guard = self.publish_lock.lock();
        let snapshot = self.ledger.snapshot()?;
        let nodes = snapshot.active_nodes();
        let mut files = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let payload = render(file, &nodes)?;
            let outcome = publish_atomic(&file.path, &payload)?;
            if outcome.was_written() {
                info!(
                    "event=targets_published path={} revision={} targets={} digest={}",
                    file.path.display(),
                    snapshot.revision,
                    nodes.len(),
                    outcome.digest()
                );
            } else {
                debug!(
                    "event=targets_unchanged path={} revision={} digest={}",
                    file.path.display(),
                    snapshot.revision,
                    outcome.digest()
                );
            }
            files.push((file.path.clone(), outcome));
        }
        self.metrics.inc_counter("targets.refreshes", 1);
        self.metrics.set_gauge("targets.active_nodes", nodes.len() as u64);
        Ok(RefreshReport {
            revision: snapshot.revision,
            node_count: nodes.len(),
            files,
        })
    }
}
