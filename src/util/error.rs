use crate::orchestrator::ToolError;
use crate::persistence::{LedgerError, LedgerKey};
use crate::targets::PublishError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Cluster,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// Failures of the ledger or of the publish step that are not the caller's fault.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },
    #[error("node endpoint {endpoint} unreachable: {reason}")]
    UnreachableNode { endpoint: String, reason: String },
    #[error(transparent)]
    ExternalTool(#[from] ToolError),
    #[error("consistency failure: {0}")]
    Consistency(#[from] ConsistencyError),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ControlPlaneError {
    pub fn validation(message: impl Into<String>) -> Self {
        ControlPlaneError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ControlPlaneError::Conflict(message.into())
    }

    pub fn node_not_found(name: impl Into<String>) -> Self {
        ControlPlaneError::NotFound {
            kind: EntityKind::Node,
            name: name.into(),
        }
    }

    pub fn cluster_not_found(name: impl Into<String>) -> Self {
        ControlPlaneError::NotFound {
            kind: EntityKind::Cluster,
            name: name.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControlPlaneError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlPlaneError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ControlPlaneError::Validation(_))
    }
}

impl From<LedgerError> for ControlPlaneError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::PreconditionFailed { key } => match key {
                LedgerKey::Node(name) => {
                    ControlPlaneError::Conflict(format!("node '{name}' was modified concurrently"))
                }
                LedgerKey::Cluster(name) => ControlPlaneError::Conflict(format!(
                    "cluster '{name}' was modified concurrently"
                )),
                LedgerKey::Claim(name) => ControlPlaneError::Conflict(format!(
                    "node '{name}' is claimed by a forming cluster"
                )),
            },
            other => ControlPlaneError::Consistency(ConsistencyError::Ledger(other)),
        }
    }
}

impl From<PublishError> for ControlPlaneError {
    fn from(err: PublishError) -> Self {
        ControlPlaneError::Consistency(ConsistencyError::Publish(err))
    }
}
