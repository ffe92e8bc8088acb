use crate::model::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const ALIAS_LABEL: &str = "alias";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortSelector {
    /// The node's registered service port.
    Service,
    Fixed(u16),
}

impl PortSelector {
    fn resolve(self, node: &Node) -> u16 {
        match self {
            PortSelector::Service => node.port,
            PortSelector::Fixed(port) => port,
        }
    }
}

/// One published scrape-target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub path: PathBuf,
    /// Written as `service` or `{fixed: <port>}` in YAML.
    #[serde(
        default = "default_ports",
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    pub ports: Vec<PortSelector>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_ports() -> Vec<PortSelector> {
    vec![PortSelector::Service]
}

impl TargetFile {
    pub fn service(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ports: default_ports(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_ports(mut self, ports: Vec<PortSelector>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Entry in a Prometheus file-based service discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

pub fn target_groups(file: &TargetFile, nodes: &[Node]) -> Vec<TargetGroup> {
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
        .into_iter()
        .map(|node| {
            let mut targets: Vec<String> = file
                .ports
                .iter()
                .map(|selector| node.endpoint_with_port(selector.resolve(node)))
                .collect();
            targets.dedup();
            let mut labels = file.labels.clone();
            labels.insert(ALIAS_LABEL.to_string(), node.name.clone());
            TargetGroup { targets, labels }
        })
        .collect()
}

/// Deterministic rendering: the same node set always yields the same bytes.
pub fn render(file: &TargetFile, nodes: &[Node]) -> Result<Vec<u8>, serde_json::Error> {
    let mut payload = serde_json::to_vec_pretty(&target_groups(file, nodes))?;
    payload.push(b'\n');
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, address: &str, port: u16) -> Node {
        Node::new(name, address, port, 0)
    }

    #[test]
    fn render_orders_by_name_and_labels_alias() {
        let file = TargetFile::service("targets.json").with_label("job", "storage");
        let nodes = vec![
            node("node-b", "100.64.0.2", 9000),
            node("node-a", "100.64.0.1", 9000),
        ];
        let groups = target_groups(&file, &nodes);
        assert_eq!(groups[0].targets, vec!["100.64.0.1:9000"]);
        assert_eq!(groups[0].labels["alias"], "node-a");
        assert_eq!(groups[0].labels["job"], "storage");
        assert_eq!(groups[1].labels["alias"], "node-b");
    }

    #[test]
    fn fixed_ports_expand_per_node() {
        let file = TargetFile::service("minio.json")
            .with_ports(vec![PortSelector::Fixed(9001), PortSelector::Fixed(9003)]);
        let groups = target_groups(&file, &[node("node-a", "fd7a::1", 9000)]);
        assert_eq!(groups[0].targets, vec!["[fd7a::1]:9001", "[fd7a::1]:9003"]);
    }

    #[test]
    fn alias_label_cannot_be_overridden() {
        let file = TargetFile::service("t.json").with_label("alias", "spoofed");
        let groups = target_groups(&file, &[node("node-a", "10.0.0.1", 9000)]);
        assert_eq!(groups[0].labels["alias"], "node-a");
    }

    #[test]
    fn empty_snapshot_renders_empty_array() {
        let rendered = render(&TargetFile::service("t.json"), &[]).unwrap();
        assert_eq!(rendered, b"[]\n");
    }

    #[test]
    fn rendering_is_independent_of_input_order() {
        let file = TargetFile::service("t.json");
        let a = node("a", "10.0.0.1", 9000);
        let b = node("b", "10.0.0.2", 9000);
        assert_eq!(
            render(&file, &[a.clone(), b.clone()]).unwrap(),
            render(&file, &[b, a]).unwrap()
        );
    }
}
