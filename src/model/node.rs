use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Healthy,
    Unreachable,
    Retired,
}

impl NodeStatus {
    /// Nodes that appear in `list_active` snapshots and scrape targets.
    pub fn is_active(self) -> bool {
        matches!(self, NodeStatus::Pending | NodeStatus::Healthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Unreachable => "UNREACHABLE",
            NodeStatus::Retired => "RETIRED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub registered_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, now_ms: u64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            status: NodeStatus::Pending,
            registered_at_ms: now_ms,
            last_seen_ms: None,
            cluster: None,
        }
    }

    pub fn endpoint(&self) -> String {
        format_endpoint(&self.address, self.port)
    }

    pub fn endpoint_with_port(&self, port: u16) -> String {
        format_endpoint(&self.address, port)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn format_endpoint(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]:{port}"),
        _ => format!("{address}:{port}"),
    }
}
