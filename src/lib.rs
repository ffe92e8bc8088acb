//! Control plane for storage nodes on an overlay network: a node registry,
//! scrape-target publication that follows membership, and replication cluster
//! formation through an external tool.

pub mod api;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod targets;
pub mod telemetry;
pub mod util;

pub use api::{
    Ack, ClusterStatusRequest, ControlPlane, ControlPlaneBuilder, DeregisterNodeRequest,
    FormClusterRequest, RegisterNodeRequest,
};
pub use config::{
    ConfigError, ControlPlaneConfig, ProbeConfig, ProbeKind, RefreshConfig, ReplicationConfig,
};
pub use model::{Cluster, ClusterStatus, Node, NodeStatus};
pub use orchestrator::{
    ClusterOrchestrator, McReplicationTool, ReplicationMember, ReplicationTool, ToolError,
};
pub use persistence::{
    FileLedger, InMemoryLedger, LedgerError, LedgerSnapshot, LedgerStore, LedgerTxn,
    Precondition,
};
pub use registry::{
    HealthProbe, HttpLivenessProbe, NodeRegistry, ProbeError, ProbeScheduler, TcpProbe,
};
pub use targets::{
    PortSelector, PublishError, PublishOutcome, RefreshHandle, RefreshReport, RefreshSignal,
    RefreshWorker, TargetFile, TargetGenerator,
};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
pub use util::{CancellationToken, ConsistencyError, ControlPlaneError, EntityKind, RetryPolicy};
