//! Node Registry: the only writer of node health and lifecycle state.

mod probe;
mod scheduler;

pub use probe::{
    HealthProbe, HttpLivenessProbe, ProbeError, TcpProbe, DEFAULT_HEALTH_PATH,
    DEFAULT_PROBE_TIMEOUT,
};
pub use scheduler::ProbeScheduler;

use crate::model::validate::{validate_address, validate_name, validate_port};
use crate::model::{format_endpoint, Node, NodeStatus};
use crate::persistence::{LedgerKey, LedgerStore, LedgerTxn, Precondition};
use crate::targets::RefreshSignal;
use crate::telemetry::MetricsRegistry;
use crate::util::{system_time_to_ms, ConsistencyError, ControlPlaneError, NamedLocks};
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

const MAX_CAS_ATTEMPTS: usize = 16;
const PROBE_SWEEP_PARALLELISM: usize = 16;

pub struct NodeRegistry {
    ledger: Arc<dyn LedgerStore>,
    probe: Arc<dyn HealthProbe>,
    probe_on_register: bool,
    locks: NamedLocks,
    refresh: RefreshSignal,
    metrics: MetricsRegistry,
}

impl NodeRegistry {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        probe: Arc<dyn HealthProbe>,
        refresh: RefreshSignal,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            ledger,
            probe,
            probe_on_register: true,
            locks: NamedLocks::new(),
            refresh,
            metrics,
        }
    }

    /// When disabled, new nodes start `PENDING` and wait for the next probe.
    pub fn with_probe_on_register(mut self, enabled: bool) -> Self {
        self.probe_on_register = enabled;
        self
    }

    pub fn register_node(
        &self,
        name: &str,
        address: &str,
        port: u16,
        now: SystemTime,
    ) -> Result<Node, ControlPlaneError> {
        validate_name(name, "name")?;
        validate_address(address)?;
        validate_port(port)?;

        let endpoint = format_endpoint(address, port);
        // Endpoint keys contain ':' and can never collide with a node name.
        let endpoint_key = format!("endpoint:{endpoint}");
        let _guards = self.locks.lock_all([name, endpoint_key.as_str()]);

        let snapshot = self.ledger.snapshot()?;
        let existing = snapshot.node(name);
        if let Some(entry) = existing {
            if entry.value.status != NodeStatus::Retired {
                self.metrics.inc_counter("registry.register_conflicts", 1);
                return Err(ControlPlaneError::conflict(format!(
                    "node '{name}' is already registered ({})",
                    entry.value.status
                )));
            }
        }
        if let Some(other) = snapshot
            .nodes()
            .find(|node| node.status != NodeStatus::Retired && node.endpoint() == endpoint)
        {
            self.metrics.inc_counter("registry.register_conflicts", 1);
            return Err(ControlPlaneError::conflict(format!(
                "endpoint {endpoint} is already registered as node '{}'",
                other.name
            )));
        }
        let precondition = Precondition::for_version(existing.map(|entry| entry.version));
        drop(snapshot);

        let now_ms = system_time_to_ms(now);
        let mut node = Node::new(name, address, port, now_ms);
        if self.probe_on_register {
            match self.probe.probe(address, port) {
                Ok(()) => {
                    node.status = NodeStatus::Healthy;
                    node.last_seen_ms = Some(now_ms);
                }
                Err(err) => {
                    warn!(
                        "event=register_probe_failed node={} endpoint={} error={}",
                        name, endpoint, err
                    );
                }
            }
        }

        self.ledger
            .commit(LedgerTxn::new().put_node(precondition, node.clone()))?;
        self.metrics.inc_counter("registry.registrations", 1);
        info!(
            "event=node_registered node={} endpoint={} status={}",
            node.name, endpoint, node.status
        );
        self.refresh.notify();
        Ok(node)
    }

    /// Soft-deletes `name` to `RETIRED`. Members of a live cluster, and nodes
    /// reserved by a forming cluster, are refused.
    pub fn deregister_node(&self, name: &str, now: SystemTime) -> Result<Node, ControlPlaneError> {
        validate_name(name, "name")?;
        let _guard = self.locks.lock(name);

        let snapshot = self.ledger.snapshot()?;
        let entry = snapshot
            .node(name)
            .filter(|entry| entry.value.status != NodeStatus::Retired)
            .ok_or_else(|| ControlPlaneError::node_not_found(name))?;
        if let Some(claim) = snapshot.claim(name) {
            return Err(ControlPlaneError::conflict(format!(
                "node '{name}' is being formed into cluster '{}'",
                claim.value.cluster
            )));
        }
        if let Some(cluster_name) = &entry.value.cluster {
            if let Some(cluster) = snapshot.cluster(cluster_name) {
                if cluster.value.status.holds_members() {
                    return Err(ControlPlaneError::conflict(format!(
                        "node '{name}' is a member of {} cluster '{cluster_name}'",
                        cluster.value.status
                    )));
                }
            }
        }

        let was_active = entry.value.is_active();
        let mut retired = entry.value.clone();
        retired.status = NodeStatus::Retired;
        retired.cluster = None;
        let txn = LedgerTxn::new()
            .put_node(Precondition::Version(entry.version), retired.clone())
            .require(LedgerKey::Claim(name.to_string()), Precondition::Absent);
        drop(snapshot);
        self.ledger.commit(txn)?;

        self.metrics.inc_counter("registry.deregistrations", 1);
        info!(
            "event=node_retired node={} at_ms={}",
            name,
            system_time_to_ms(now)
        );
        if was_active {
            self.refresh.notify();
        }
        Ok(retired)
    }

    /// Re-evaluates reachability and records the result. Retired nodes are
    /// returned untouched.
    pub fn probe_node(&self, name: &str, now: SystemTime) -> Result<Node, ControlPlaneError> {
        let target = self.get_node(name)?;
        if target.status == NodeStatus::Retired {
            return Ok(target);
        }
        let outcome = self.probe.probe(&target.address, target.port);
        self.metrics.inc_counter("registry.probes", 1);
        let now_ms = system_time_to_ms(now);

        let _guard = self.locks.lock(name);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.ledger.snapshot()?;
            let entry = snapshot
                .node(name)
                .ok_or_else(|| ControlPlaneError::node_not_found(name))?;
            let current = &entry.value;
            if current.status == NodeStatus::Retired
                || current.address != target.address
                || current.port != target.port
            {
                // Retired or re-registered while the probe was in flight.
                return Ok(current.clone());
            }
            let mut next = current.clone();
            match &outcome {
                Ok(()) => {
                    next.status = NodeStatus::Healthy;
                    next.last_seen_ms = Some(now_ms);
                }
                Err(_) => next.status = NodeStatus::Unreachable,
            }
            if next == *current {
                return Ok(next);
            }
            let previous = current.status;
            let txn = LedgerTxn::new().put_node(Precondition::Version(entry.version), next.clone());
            drop(snapshot);
            match self.ledger.commit(txn) {
                Ok(_) => {
                    self.log_transition(previous, &next, &outcome);
                    if previous.is_active() != next.status.is_active() {
                        self.refresh.notify();
                    }
                    return Ok(next);
                }
                Err(err) if err.is_precondition_failure() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(ConsistencyError::Other(format!(
            "node '{name}' kept changing during probe; gave up after {MAX_CAS_ATTEMPTS} attempts"
        ))
        .into())
    }

    /// Probes every non-retired node. Individual probe failures are recorded
    /// as status; only ledger failures are logged and skipped.
    pub fn probe_all(&self, now: SystemTime) -> Result<Vec<Node>, ControlPlaneError> {
        let names: Vec<String> = self
            .ledger
            .snapshot()?
            .nodes()
            .filter(|node| node.status != NodeStatus::Retired)
            .map(|node| node.name.clone())
            .collect();
        let mut probed = Vec::with_capacity(names.len());
        for batch in names.chunks(PROBE_SWEEP_PARALLELISM) {
            let results: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|name| scope.spawn(move || self.probe_node(name, now)))
                    .collect();
                handles.into_iter().map(|handle| handle.join()).collect()
            });
            for (name, result) in batch.iter().zip(results) {
                match result {
                    Ok(Ok(node)) => probed.push(node),
                    Ok(Err(err)) => warn!("event=probe_failed node={} error={}", name, err),
                    Err(_) => warn!("event=probe_panicked node={}", name),
                }
            }
        }
        Ok(probed)
    }

    /// Consistent snapshot of `HEALTHY` and `PENDING` nodes, ordered by name.
    pub fn list_active(&self) -> Result<Vec<Node>, ControlPlaneError> {
        Ok(self.ledger.snapshot()?.active_nodes())
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, ControlPlaneError> {
        Ok(self.ledger.snapshot()?.nodes().cloned().collect())
    }

    pub fn get_node(&self, name: &str) -> Result<Node, ControlPlaneError> {
        self.ledger
            .snapshot()?
            .node(name)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| ControlPlaneError::node_not_found(name))
    }

    /// One-off reachability check of an arbitrary endpoint; nothing is recorded.
    pub fn check_endpoint(&self, address: &str, port: u16) -> Result<(), ControlPlaneError> {
        validate_address(address)?;
        validate_port(port)?;
        self.probe
            .probe(address, port)
            .map_err(|err| ControlPlaneError::UnreachableNode {
                endpoint: err.endpoint().to_string(),
                reason: err.to_string(),
            })
    }

    fn log_transition(&self, previous: NodeStatus, next: &Node, outcome: &Result<(), ProbeError>) {
        if previous == next.status {
            return;
        }
        match outcome {
            Ok(()) => info!(
                "event=node_status node={} from={} to={}",
                next.name, previous, next.status
            ),
            Err(err) => warn!(
                "event=node_status node={} from={} to={} error={}",
                next.name, previous, next.status, err
            ),
        }
    }
}
