use crate::model::{Cluster, Node};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Store of record for nodes, clusters and formation claims.
///
/// Readers get an immutable point-in-time [`LedgerSnapshot`]; writers submit a
/// [`LedgerTxn`] whose preconditions are checked and applied atomically.
pub trait LedgerStore: Send + Sync {
    fn snapshot(&self) -> Result<Arc<LedgerSnapshot>, LedgerError>;

    /// Applies `txn` atomically and returns the new ledger revision.
    fn commit(&self, txn: LedgerTxn) -> Result<u64, LedgerError>;

    /// Shared lease held for the lifetime of one formation. Stores visible to
    /// several processes use it to keep recovery away from live formations.
    fn formation_lease(&self) -> Result<FormationLease, LedgerError> {
        Ok(FormationLease::local())
    }

    /// Exclusive lease for stale-formation recovery, or `None` while any
    /// formation lease is held.
    fn try_recovery_lease(&self) -> Result<Option<FormationLease>, LedgerError> {
        Ok(Some(FormationLease::local()))
    }
}

/// Guard returned by [`LedgerStore::formation_lease`] and
/// [`LedgerStore::try_recovery_lease`]; dropping it releases the lease.
#[derive(Debug)]
pub struct FormationLease {
    _file: Option<std::fs::File>,
}

impl FormationLease {
    /// Lease for stores that live inside one process.
    pub fn local() -> Self {
        Self { _file: None }
    }

    pub(crate) fn held(file: std::fs::File) -> Self {
        Self { _file: Some(file) }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("precondition failed for {key}")]
    PreconditionFailed { key: LedgerKey },
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger document is corrupt: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, LedgerError::PreconditionFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedgerKey {
    Node(String),
    Cluster(String),
    /// Formation reservation keyed by node name.
    Claim(String),
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKey::Node(name) => write!(f, "node/{name}"),
            LedgerKey::Cluster(name) => write!(f, "cluster/{name}"),
            LedgerKey::Claim(name) => write!(f, "claim/{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
    Any,
}

impl Precondition {
    fn holds(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Version(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }

    pub fn for_version(version: Option<u64>) -> Self {
        version.map_or(Precondition::Absent, Precondition::Version)
    }
}

/// A formation reservation: `node` is being formed into `cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub revision: u64,
    #[serde(default)]
    nodes: BTreeMap<String, Versioned<Node>>,
    #[serde(default)]
    clusters: BTreeMap<String, Versioned<Cluster>>,
    #[serde(default)]
    claims: BTreeMap<String, Versioned<Claim>>,
}

impl LedgerSnapshot {
    pub fn node(&self, name: &str) -> Option<&Versioned<Node>> {
        self.nodes.get(name)
    }

    pub fn cluster(&self, name: &str) -> Option<&Versioned<Cluster>> {
        self.clusters.get(name)
    }

    pub fn claim(&self, node: &str) -> Option<&Versioned<Claim>> {
        self.claims.get(node)
    }

    /// All nodes ordered by name, including retired ones.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|entry| &entry.value)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values().map(|entry| &entry.value)
    }

    /// `HEALTHY` and `PENDING` nodes ordered by name.
    pub fn active_nodes(&self) -> Vec<Node> {
        self.nodes().filter(|node| node.is_active()).cloned().collect()
    }

    fn version_of(&self, key: &LedgerKey) -> Option<u64> {
        match key {
            LedgerKey::Node(name) => self.nodes.get(name).map(|entry| entry.version),
            LedgerKey::Cluster(name) => self.clusters.get(name).map(|entry| entry.version),
            LedgerKey::Claim(name) => self.claims.get(name).map(|entry| entry.version),
        }
    }

    /// Checks every precondition against `self`, then returns the successor
    /// snapshot. Nothing is applied when any precondition fails.
    pub(crate) fn apply(&self, txn: LedgerTxn) -> Result<LedgerSnapshot, LedgerError> {
        for op in &txn.ops {
            if !op.precondition.holds(self.version_of(&op.key)) {
                return Err(LedgerError::PreconditionFailed {
                    key: op.key.clone(),
                });
            }
        }
        let mut next = self.clone();
        next.revision = self.revision.saturating_add(1);
        let version = next.revision;
        for op in txn.ops {
            match (op.key, op.write) {
                (_, Write::Check) => {}
                (LedgerKey::Node(name), Write::Node(node)) => {
                    next.nodes.insert(name, Versioned { version, value: node });
                }
                (LedgerKey::Cluster(name), Write::Cluster(cluster)) => {
                    next.clusters.insert(
                        name,
                        Versioned {
                            version,
                            value: cluster,
                        },
                    );
                }
                (LedgerKey::Claim(name), Write::Claim(claim)) => {
                    next.claims.insert(
                        name,
                        Versioned {
                            version,
                            value: claim,
                        },
                    );
                }
                (LedgerKey::Claim(name), Write::Delete) => {
                    next.claims.remove(&name);
                }
                (key, _) => {
                    return Err(LedgerError::Corrupt(format!(
                        "write does not match key kind for {key}"
                    )))
                }
            }
        }
        Ok(next)
    }
}

#[derive(Debug, Clone)]
enum Write {
    Check,
    Node(Node),
    Cluster(Cluster),
    Claim(Claim),
    Delete,
}

#[derive(Debug, Clone)]
struct TxnOp {
    key: LedgerKey,
    precondition: Precondition,
    write: Write,
}

/// Batch of conditional writes committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct LedgerTxn {
    ops: Vec<TxnOp>,
}

impl LedgerTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_node(mut self, precondition: Precondition, node: Node) -> Self {
        self.ops.push(TxnOp {
            key: LedgerKey::Node(node.name.clone()),
            precondition,
            write: Write::Node(node),
        });
        self
    }

    pub fn put_cluster(mut self, precondition: Precondition, cluster: Cluster) -> Self {
        self.ops.push(TxnOp {
            key: LedgerKey::Cluster(cluster.name.clone()),
            precondition,
            write: Write::Cluster(cluster),
        });
        self
    }

    pub fn put_claim(mut self, node: &str, precondition: Precondition, claim: Claim) -> Self {
        self.ops.push(TxnOp {
            key: LedgerKey::Claim(node.to_string()),
            precondition,
            write: Write::Claim(claim),
        });
        self
    }

    pub fn delete_claim(mut self, node: &str, precondition: Precondition) -> Self {
        self.ops.push(TxnOp {
            key: LedgerKey::Claim(node.to_string()),
            precondition,
            write: Write::Delete,
        });
        self
    }

    /// Adds a precondition without writing the key.
    pub fn require(mut self, key: LedgerKey, precondition: Precondition) -> Self {
        self.ops.push(TxnOp {
            key,
            precondition,
            write: Write::Check,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
