//! Node and cluster records as stored in the ledger.

mod cluster;
mod node;
pub mod validate;

pub use cluster::{Cluster, ClusterStatus};
pub use node::{format_endpoint, Node, NodeStatus};
