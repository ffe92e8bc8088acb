//! Transport-free entry points: request structs validated at the boundary and
//! the [`ControlPlane`] facade that owns every component.

use crate::config::{ControlPlaneConfig, ProbeKind};
use crate::model::validate::{
    parse_alias_list, validate_address, validate_aliases, validate_name, validate_port,
};
use crate::model::{Cluster, Node};
use crate::orchestrator::{ClusterOrchestrator, McReplicationTool, ReplicationTool};
use crate::persistence::{FileLedger, InMemoryLedger, LedgerStore};
use crate::registry::{HealthProbe, HttpLivenessProbe, NodeRegistry, ProbeScheduler, TcpProbe};
use crate::targets::{
    RefreshHandle, RefreshReport, RefreshSignal, RefreshWorker, TargetFile, TargetGenerator,
};
use crate::telemetry::MetricsRegistry;
use crate::util::{CancellationToken, ConsistencyError, ControlPlaneError, RetryPolicy};
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl RegisterNodeRequest {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        validate_name(&self.name, "name")?;
        validate_address(&self.address)?;
        validate_port(self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterNodeRequest {
    pub name: String,
}

impl DeregisterNodeRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        validate_name(&self.name, "name")
    }
}

/// Cluster formation request. `aliases` accepts a list or a single
/// comma-separated string; either way entries are trimmed and empties dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormClusterRequest {
    pub name: String,
    #[serde(deserialize_with = "deserialize_aliases")]
    pub aliases: Vec<String>,
}

impl FormClusterRequest {
    pub fn new<I, S>(name: impl Into<String>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            aliases: normalize_aliases(aliases.into_iter().map(Into::into)),
        }
    }

    pub fn from_joined(name: impl Into<String>, aliases: &str) -> Self {
        Self {
            name: name.into(),
            aliases: parse_alias_list(aliases),
        }
    }

    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        validate_name(&self.name, "cluster name")?;
        validate_aliases(&self.aliases)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatusRequest {
    pub name: String,
}

impl ClusterStatusRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        validate_name(&self.name, "cluster name")
    }
}

/// Acknowledgement for operations with no record to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub name: String,
    pub message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AliasInput {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_aliases<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match AliasInput::deserialize(deserializer)? {
        AliasInput::List(list) => normalize_aliases(list),
        AliasInput::Joined(joined) => parse_alias_list(&joined),
    })
}

fn normalize_aliases(aliases: impl IntoIterator<Item = String>) -> Vec<String> {
    aliases
        .into_iter()
        .map(|alias| alias.trim().to_string())
        .filter(|alias| !alias.is_empty())
        .collect()
}

pub struct ControlPlaneBuilder {
    ledger: Arc<dyn LedgerStore>,
    probe: Arc<dyn HealthProbe>,
    tool: Arc<dyn ReplicationTool>,
    files: Vec<TargetFile>,
    tool_retry: RetryPolicy,
    refresh_retry: RetryPolicy,
    probe_on_register: bool,
    metrics: MetricsRegistry,
}

impl ControlPlaneBuilder {
    pub fn new(probe: Arc<dyn HealthProbe>, tool: Arc<dyn ReplicationTool>) -> Self {
        let defaults = ControlPlaneConfig::default();
        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            probe,
            tool,
            files: defaults.targets,
            tool_retry: defaults.replication.retry_policy(),
            refresh_retry: defaults.refresh.retry_policy(),
            probe_on_register: true,
            metrics: MetricsRegistry::default(),
        }
    }

    pub fn ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn target_files(mut self, files: Vec<TargetFile>) -> Self {
        self.files = files;
        self
    }

    pub fn tool_retry(mut self, retry: RetryPolicy) -> Self {
        self.tool_retry = retry;
        self
    }

    pub fn refresh_retry(mut self, retry: RetryPolicy) -> Self {
        self.refresh_retry = retry;
        self
    }

    pub fn probe_on_register(mut self, enabled: bool) -> Self {
        self.probe_on_register = enabled;
        self
    }

    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    /// Wires the components, fails formations left over from a previous
    /// process, starts the refresh worker and schedules an initial refresh.
    pub fn build(self) -> Result<ControlPlane, ControlPlaneError> {
        let signal = RefreshSignal::new();
        let registry = Arc::new(
            NodeRegistry::new(
                Arc::clone(&self.ledger),
                self.probe,
                signal.clone(),
                self.metrics.clone(),
            )
            .with_probe_on_register(self.probe_on_register),
        );
        let orchestrator = Arc::new(ClusterOrchestrator::new(
            Arc::clone(&self.ledger),
            Arc::clone(&registry),
            self.tool,
            self.tool_retry,
            self.metrics.clone(),
        ));
        let generator = Arc::new(TargetGenerator::new(
            Arc::clone(&self.ledger),
            self.files,
            self.metrics.clone(),
        ));

        let stale = orchestrator.fail_stale_formations(SystemTime::now())?;
        if !stale.is_empty() {
            warn!("event=stale_formations_failed clusters={}", stale.join(","));
        }
        let refresh = RefreshWorker::spawn(
            Arc::clone(&generator),
            signal.clone(),
            self.refresh_retry,
            self.metrics.clone(),
        )
        .map_err(|err| {
            ConsistencyError::Other(format!("failed to start refresh worker: {err}"))
        })?;
        signal.notify();
        info!(
            "event=control_plane_started target_files={}",
            generator.files().len()
        );
        Ok(ControlPlane {
            registry,
            orchestrator,
            generator,
            signal,
            metrics: self.metrics,
            refresh: Some(refresh),
        })
    }
}

/// Owns the registry, orchestrator, target generator and refresh worker.
pub struct ControlPlane {
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<ClusterOrchestrator>,
    generator: Arc<TargetGenerator>,
    signal: RefreshSignal,
    metrics: MetricsRegistry,
    refresh: Option<RefreshHandle>,
}

impl ControlPlane {
    pub fn builder(probe: Arc<dyn HealthProbe>, tool: Arc<dyn ReplicationTool>) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(probe, tool)
    }

    /// Opens the file ledger and the real probe and `mc` adapters described by
    /// `config`.
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let ledger = FileLedger::open(&config.ledger_path)?;
        let probe: Arc<dyn HealthProbe> = match config.probe.kind {
            ProbeKind::Tcp => Arc::new(TcpProbe::new(config.probe.timeout())),
            ProbeKind::Http => Arc::new(HttpLivenessProbe::new(
                config.probe.timeout(),
                config.probe.health_path.clone(),
            )),
        };
        let replication = &config.replication;
        let tool = McReplicationTool::new(
            &replication.binary,
            replication.access_key.clone(),
            replication.secret_key.clone(),
        )
        .with_scheme(replication.scheme.clone())
        .with_attempt_timeout(replication.attempt_timeout())
        .with_reset_before_apply(replication.reset_before_apply);
        ControlPlaneBuilder::new(probe, Arc::new(tool))
            .ledger(Arc::new(ledger))
            .target_files(config.targets.clone())
            .tool_retry(replication.retry_policy())
            .refresh_retry(config.refresh.retry_policy())
            .probe_on_register(config.probe.on_register)
            .build()
    }

    pub fn register_node(&self, request: &RegisterNodeRequest) -> Result<Node, ControlPlaneError> {
        request.validate()?;
        self.registry.register_node(
            &request.name,
            &request.address,
            request.port,
            SystemTime::now(),
        )
    }

    pub fn deregister_node(&self, request: &DeregisterNodeRequest) -> Result<Ack, ControlPlaneError> {
        request.validate()?;
        let node = self.registry.deregister_node(&request.name, SystemTime::now())?;
        Ok(Ack {
            name: node.name,
            message: "node retired".to_string(),
        })
    }

    pub fn probe_node(&self, name: &str) -> Result<Node, ControlPlaneError> {
        validate_name(name, "name")?;
        self.registry.probe_node(name, SystemTime::now())
    }

    pub fn probe_all(&self) -> Result<Vec<Node>, ControlPlaneError> {
        self.registry.probe_all(SystemTime::now())
    }

    pub fn list_active(&self) -> Result<Vec<Node>, ControlPlaneError> {
        self.registry.list_active()
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, ControlPlaneError> {
        self.registry.list_nodes()
    }

    pub fn get_node(&self, name: &str) -> Result<Node, ControlPlaneError> {
        validate_name(name, "name")?;
        self.registry.get_node(name)
    }

    pub fn form_cluster(
        &self,
        request: &FormClusterRequest,
        cancel: &CancellationToken,
    ) -> Result<Cluster, ControlPlaneError> {
        request.validate()?;
        self.orchestrator
            .form_cluster(&request.name, &request.aliases, SystemTime::now(), cancel)
    }

    pub fn get_cluster_status(&self, request: &ClusterStatusRequest) -> Result<Cluster, ControlPlaneError> {
        request.validate()?;
        self.orchestrator.get_cluster_status(&request.name)
    }

    pub fn list_clusters(&self) -> Result<Vec<Cluster>, ControlPlaneError> {
        self.orchestrator.list_clusters()
    }

    pub fn reconcile_cluster(&self, name: &str) -> Result<Cluster, ControlPlaneError> {
        validate_name(name, "cluster name")?;
        self.orchestrator.reconcile_cluster(name, SystemTime::now())
    }

    pub fn add_members(&self, name: &str, aliases: &[String]) -> Result<Cluster, ControlPlaneError> {
        validate_name(name, "cluster name")?;
        self.orchestrator.add_members(name, aliases)
    }

    /// Publishes on the caller's thread, surfacing publish errors directly.
    pub fn refresh_now(&self) -> Result<RefreshReport, ControlPlaneError> {
        Ok(self.generator.refresh()?)
    }

    /// Waits for the background worker to publish every requested refresh.
    pub fn wait_for_refresh(&self, timeout: Duration) -> bool {
        self.signal.wait_idle(timeout)
    }

    pub fn refresh_signal(&self) -> &RefreshSignal {
        &self.signal
    }

    pub fn spawn_probe_scheduler(&self, interval: Duration) -> std::io::Result<ProbeScheduler> {
        ProbeScheduler::spawn(Arc::clone(&self.registry), interval)
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn shutdown(&mut self) {
        if let Some(mut refresh) = self.refresh.take() {
            refresh.shutdown();
            info!("event=control_plane_stopped");
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}
