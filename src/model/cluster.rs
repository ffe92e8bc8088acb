use crate::orchestrator::ToolError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Forming,
    Active,
    Degraded,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Forming => "FORMING",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Degraded => "DEGRADED",
            ClusterStatus::Failed => "FAILED",
        }
    }

    /// Every status except `FAILED` holds (or is acquiring) its members.
    pub fn holds_members(self) -> bool {
        !matches!(self, ClusterStatus::Failed)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// Aliases in the order they were handed to the replication tool.
    pub requested: Vec<String>,
    /// Attached members; empty unless formation succeeded.
    pub members: Vec<String>,
    pub status: ClusterStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ToolError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl Cluster {
    pub fn forming(name: impl Into<String>, requested: Vec<String>, now_ms: u64) -> Self {
        Self {
            name: name.into(),
            requested,
            members: Vec::new(),
            status: ClusterStatus::Forming,
            created_at_ms: now_ms,
            reconciled_at_ms: None,
            attempts: 0,
            last_error: None,
            diagnostic: None,
        }
    }

    pub(crate) fn activate(&mut self, now_ms: u64) {
        self.members = self.requested.clone();
        self.status = ClusterStatus::Active;
        self.reconciled_at_ms = Some(now_ms);
        self.diagnostic = None;
    }

    pub(crate) fn fail(&mut self, diagnostic: String, now_ms: u64) {
        self.members.clear();
        self.status = ClusterStatus::Failed;
        self.reconciled_at_ms = Some(now_ms);
        self.diagnostic = Some(diagnostic);
    }
}
