//! Cluster Orchestrator: validates formation requests, reserves members in
//! the ledger, drives the replication tool and records the outcome.

mod tool;

pub use crate::util::CancellationToken;
pub use tool::{classify, McReplicationTool, ReplicationMember, ReplicationTool, ToolError};

use crate::model::validate::{validate_aliases, validate_name};
use crate::model::{Cluster, ClusterStatus, NodeStatus};
use crate::persistence::{
    Claim, LedgerKey, LedgerSnapshot, LedgerStore, LedgerTxn, Precondition,
};
use crate::registry::NodeRegistry;
use crate::telemetry::MetricsRegistry;
use crate::util::{system_time_to_ms, ConsistencyError, ControlPlaneError, NamedLocks, RetryPolicy};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const MAX_CAS_ATTEMPTS: usize = 8;

enum FormationOutcome {
    Applied,
    Failed(ToolError),
    Cancelled(Option<ToolError>),
}

/// Result of validating a formation request against one ledger snapshot.
enum Admission {
    Ready {
        members: Vec<ReplicationMember>,
        versions: Vec<(String, u64)>,
    },
    NeedsProbe(Vec<String>),
}

pub struct ClusterOrchestrator {
    ledger: Arc<dyn LedgerStore>,
    registry: Arc<NodeRegistry>,
    tool: Arc<dyn ReplicationTool>,
    retry: RetryPolicy,
    locks: NamedLocks,
    metrics: MetricsRegistry,
}

impl ClusterOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        registry: Arc<NodeRegistry>,
        tool: Arc<dyn ReplicationTool>,
        retry: RetryPolicy,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            ledger,
            registry,
            tool,
            retry,
            locks: NamedLocks::new(),
            metrics,
        }
    }

    /// Forms `name` from `aliases`, in order.
    ///
    /// Validation, conflict and not-found failures are returned as errors and
    /// leave the ledger untouched. Once the `FORMING` record is committed the
    /// call returns the cluster in its final state, `ACTIVE` or `FAILED`, even
    /// when the replication tool failed.
    pub fn form_cluster(
        &self,
        name: &str,
        aliases: &[String],
        now: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<Cluster, ControlPlaneError> {
        validate_name(name, "cluster name")?;
        validate_aliases(aliases)?;
        let started = Instant::now();

        let _lease = self.ledger.formation_lease()?;
        let members = self.reserve(name, aliases, now)?;
        self.metrics.inc_counter("orchestrator.formations_started", 1);
        info!(
            "event=cluster_forming cluster={} members={}",
            name,
            aliases.join(",")
        );

        let _guard = self.locks.lock(name);
        let mut backoff = self.retry.handle();
        let mut attempts = 0u32;
        let outcome = loop {
            if cancel.is_cancelled() {
                break FormationOutcome::Cancelled(None);
            }
            attempts += 1;
            match self.tool.apply_replication(name, &members) {
                Ok(()) => break FormationOutcome::Applied,
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        self.metrics.inc_counter("orchestrator.tool_retries", 1);
                        warn!(
                            "event=replication_retry cluster={} attempt={} retry_in_ms={} error={}",
                            name,
                            attempts,
                            delay.as_millis(),
                            err
                        );
                        if cancel.wait_timeout(delay) {
                            break FormationOutcome::Cancelled(Some(err));
                        }
                    }
                    None => break FormationOutcome::Failed(err),
                },
                Err(err) => break FormationOutcome::Failed(err),
            }
        };

        let finished_ms = system_time_to_ms(now + started.elapsed());
        match outcome {
            FormationOutcome::Applied => self.attach(name, attempts, finished_ms),
            FormationOutcome::Failed(err) => {
                let diagnostic = if err.is_transient() {
                    format!("gave up after {attempts} attempts: {}", err.diagnostic())
                } else {
                    err.diagnostic().to_string()
                };
                self.record_failure(name, attempts, Some(err), diagnostic, finished_ms)
            }
            FormationOutcome::Cancelled(last) => {
                let diagnostic = format!("formation cancelled after {attempts} attempts");
                self.record_failure(name, attempts, last, diagnostic, finished_ms)
            }
        }
    }

    pub fn get_cluster_status(&self, name: &str) -> Result<Cluster, ControlPlaneError> {
        self.ledger
            .snapshot()?
            .cluster(name)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| ControlPlaneError::cluster_not_found(name))
    }

    pub fn list_clusters(&self) -> Result<Vec<Cluster>, ControlPlaneError> {
        Ok(self.ledger.snapshot()?.clusters().cloned().collect())
    }

    /// Membership is fixed once a cluster has formed.
    pub fn add_members(&self, name: &str, aliases: &[String]) -> Result<Cluster, ControlPlaneError> {
        let cluster = self.get_cluster_status(name)?;
        Err(ControlPlaneError::UnsupportedOperation(format!(
            "cannot add {} member(s) to {} cluster '{}'",
            aliases.len(),
            cluster.status,
            cluster.name
        )))
    }

    /// Re-derives `ACTIVE`/`DEGRADED` from current member health.
    pub fn reconcile_cluster(&self, name: &str, now: SystemTime) -> Result<Cluster, ControlPlaneError> {
        let _guard = self.locks.lock(name);
        let now_ms = system_time_to_ms(now);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.ledger.snapshot()?;
            let entry = snapshot
                .cluster(name)
                .ok_or_else(|| ControlPlaneError::cluster_not_found(name))?;
            let current = &entry.value;
            if !matches!(current.status, ClusterStatus::Active | ClusterStatus::Degraded) {
                return Ok(current.clone());
            }
            let previous = current.status;
            let mut next = current.clone();
            next.status = health_of(&snapshot, &current.members);
            next.reconciled_at_ms = Some(now_ms);
            let txn = LedgerTxn::new().put_cluster(Precondition::Version(entry.version), next.clone());
            drop(snapshot);
            match self.ledger.commit(txn) {
                Ok(_) => {
                    if previous != next.status {
                        self.metrics.inc_counter("orchestrator.status_changes", 1);
                        warn!(
                            "event=cluster_status cluster={} from={} to={}",
                            name, previous, next.status
                        );
                    } else {
                        info!(
                            "event=cluster_reconciled cluster={} status={}",
                            name, next.status
                        );
                    }
                    return Ok(next);
                }
                Err(err) if err.is_precondition_failure() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(exhausted("cluster", name))
    }

    /// Marks clusters left `FORMING` by an interrupted process as `FAILED` and
    /// releases their claims. Returns the names that were failed.
    pub fn fail_stale_formations(&self, now: SystemTime) -> Result<Vec<String>, ControlPlaneError> {
        let now_ms = system_time_to_ms(now);
        let Some(_lease) = self.ledger.try_recovery_lease()? else {
            info!("event=stale_formation_skip reason=formation_in_flight");
            return Ok(Vec::new());
        };
        let forming: Vec<String> = self
            .ledger
            .snapshot()?
            .clusters()
            .filter(|cluster| cluster.status == ClusterStatus::Forming)
            .map(|cluster| cluster.name.clone())
            .collect();
        let mut failed = Vec::with_capacity(forming.len());
        for name in forming {
            let Some(_guard) = self.locks.try_lock(&name) else {
                // A formation is running in this process; it is not stale.
                continue;
            };
            let cluster = self.record_failure(
                &name,
                0,
                None,
                "formation interrupted before completion".to_string(),
                now_ms,
            )?;
            warn!(
                "event=cluster_stale_formation cluster={} status={}",
                name, cluster.status
            );
            failed.push(name);
        }
        Ok(failed)
    }

    /// Validates the request and commits the `FORMING` cluster together with
    /// one claim per alias. Losing a race surfaces as the conflict the winner
    /// created.
    fn reserve(
        &self,
        name: &str,
        aliases: &[String],
        now: SystemTime,
    ) -> Result<Vec<ReplicationMember>, ControlPlaneError> {
        let mut probed = BTreeSet::new();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.ledger.snapshot()?;
            let (members, versions) = match admit(&snapshot, name, aliases, &probed)? {
                Admission::Ready { members, versions } => (members, versions),
                Admission::NeedsProbe(pending) => {
                    drop(snapshot);
                    for alias in pending {
                        let node = self.registry.probe_node(&alias, now)?;
                        probed.insert(alias);
                        if node.status != NodeStatus::Healthy {
                            return Err(not_healthy(&node.name, node.status));
                        }
                    }
                    continue;
                }
            };
            let cluster = Cluster::forming(name, aliases.to_vec(), system_time_to_ms(now));
            let mut txn = LedgerTxn::new().put_cluster(Precondition::Absent, cluster);
            for (alias, version) in versions {
                txn = txn
                    .put_claim(
                        &alias,
                        Precondition::Absent,
                        Claim {
                            cluster: name.to_string(),
                        },
                    )
                    .require(LedgerKey::Node(alias), Precondition::Version(version));
            }
            drop(snapshot);
            match self.ledger.commit(txn) {
                Ok(_) => return Ok(members),
                Err(err) if err.is_precondition_failure() => {
                    self.metrics.inc_counter("orchestrator.reservation_races", 1);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ControlPlaneError::conflict(format!(
            "cluster '{name}' or its members kept changing; retry the request"
        )))
    }

    fn attach(&self, name: &str, attempts: u32, now_ms: u64) -> Result<Cluster, ControlPlaneError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.ledger.snapshot()?;
            let entry = snapshot
                .cluster(name)
                .ok_or_else(|| ControlPlaneError::cluster_not_found(name))?;
            if entry.value.status != ClusterStatus::Forming {
                return Ok(resolved_elsewhere(&entry.value));
            }
            let mut cluster = entry.value.clone();
            cluster.activate(now_ms);
            cluster.attempts = attempts;
            cluster.last_error = None;

            let mut txn = LedgerTxn::new();
            for alias in &cluster.members {
                let node = snapshot
                    .node(alias)
                    .ok_or_else(|| ControlPlaneError::node_not_found(alias.as_str()))?;
                let mut updated = node.value.clone();
                updated.cluster = Some(name.to_string());
                txn = txn
                    .put_node(Precondition::Version(node.version), updated)
                    .delete_claim(alias, Precondition::Any);
            }
            txn = txn.put_cluster(Precondition::Version(entry.version), cluster.clone());
            drop(snapshot);
            match self.ledger.commit(txn) {
                Ok(_) => {
                    self.metrics.inc_counter("orchestrator.formations_succeeded", 1);
                    info!(
                        "event=cluster_formed cluster={} status={} attempts={} members={}",
                        name,
                        cluster.status,
                        attempts,
                        cluster.members.join(",")
                    );
                    return Ok(cluster);
                }
                Err(err) if err.is_precondition_failure() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(exhausted("cluster", name))
    }

    fn record_failure(
        &self,
        name: &str,
        attempts: u32,
        last_error: Option<ToolError>,
        diagnostic: String,
        now_ms: u64,
    ) -> Result<Cluster, ControlPlaneError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.ledger.snapshot()?;
            let entry = snapshot
                .cluster(name)
                .ok_or_else(|| ControlPlaneError::cluster_not_found(name))?;
            if entry.value.status != ClusterStatus::Forming {
                return Ok(resolved_elsewhere(&entry.value));
            }
            let mut cluster = entry.value.clone();
            cluster.fail(diagnostic.clone(), now_ms);
            cluster.attempts = attempts;
            cluster.last_error = last_error.clone();

            let mut txn = LedgerTxn::new();
            for alias in &cluster.requested {
                let claimed_here = snapshot
                    .claim(alias)
                    .is_some_and(|claim| claim.value.cluster == name);
                if claimed_here {
                    txn = txn.delete_claim(alias, Precondition::Any);
                }
            }
            txn = txn.put_cluster(Precondition::Version(entry.version), cluster.clone());
            drop(snapshot);
            match self.ledger.commit(txn) {
                Ok(_) => {
                    self.metrics.inc_counter("orchestrator.formations_failed", 1);
                    warn!(
                        "event=cluster_failed cluster={} attempts={} diagnostic={}",
                        name, attempts, diagnostic
                    );
                    return Ok(cluster);
                }
                Err(err) if err.is_precondition_failure() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(exhausted("cluster", name))
    }
}

fn resolved_elsewhere(cluster: &Cluster) -> Cluster {
    warn!(
        "event=cluster_outcome_skipped cluster={} status={}",
        cluster.name, cluster.status
    );
    cluster.clone()
}

fn admit(
    snapshot: &LedgerSnapshot,
    name: &str,
    aliases: &[String],
    probed: &BTreeSet<String>,
) -> Result<Admission, ControlPlaneError> {
    if let Some(existing) = snapshot.cluster(name) {
        return Err(ControlPlaneError::conflict(format!(
            "cluster '{name}' already exists ({})",
            existing.value.status
        )));
    }
    let mut members = Vec::with_capacity(aliases.len());
    let mut versions = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let entry = snapshot
            .node(alias)
            .filter(|entry| entry.value.status != NodeStatus::Retired)
            .ok_or_else(|| ControlPlaneError::node_not_found(alias.as_str()))?;
        members.push(ReplicationMember {
            alias: alias.clone(),
            address: entry.value.address.clone(),
            port: entry.value.port,
        });
        versions.push((alias.clone(), entry.version));
    }
    for alias in aliases {
        if let Some(claim) = snapshot.claim(alias) {
            return Err(ControlPlaneError::conflict(format!(
                "node '{alias}' is being formed into cluster '{}'",
                claim.value.cluster
            )));
        }
        let current = snapshot
            .node(alias)
            .and_then(|entry| entry.value.cluster.as_deref());
        if let Some(other) = current {
            let live = snapshot
                .cluster(other)
                .is_some_and(|cluster| cluster.value.status.holds_members());
            if live {
                return Err(ControlPlaneError::conflict(format!(
                    "node '{alias}' already belongs to cluster '{other}'"
                )));
            }
        }
    }
    let mut pending = Vec::new();
    for alias in aliases {
        let Some(entry) = snapshot.node(alias) else {
            return Err(ControlPlaneError::node_not_found(alias.as_str()));
        };
        match entry.value.status {
            NodeStatus::Healthy => {}
            NodeStatus::Pending if !probed.contains(alias) => pending.push(alias.clone()),
            status => return Err(not_healthy(alias, status)),
        }
    }
    if !pending.is_empty() {
        return Ok(Admission::NeedsProbe(pending));
    }
    Ok(Admission::Ready { members, versions })
}

/// `ACTIVE` when every member is `HEALTHY`, otherwise `DEGRADED`.
fn health_of(snapshot: &LedgerSnapshot, members: &[String]) -> ClusterStatus {
    let all_healthy = members.iter().all(|alias| {
        snapshot
            .node(alias)
            .is_some_and(|entry| entry.value.status == NodeStatus::Healthy)
    });
    if all_healthy {
        ClusterStatus::Active
    } else {
        ClusterStatus::Degraded
    }
}

fn not_healthy(alias: &str, status: NodeStatus) -> ControlPlaneError {
    ControlPlaneError::validation(format!(
        "node '{alias}' is {status}; clusters can only be formed from HEALTHY nodes"
    ))
}

fn exhausted(kind: &str, name: &str) -> ControlPlaneError {
    ConsistencyError::Other(format!(
        "{kind} '{name}' kept changing; gave up after {MAX_CAS_ATTEMPTS} attempts"
    ))
    .into()
}
