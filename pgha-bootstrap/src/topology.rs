use crate::common::ETCD_PEER_PORT;
use crate::error::BootstrapError;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Error;
use std::net::IpAddr;
use std::path::Path;

pub const CLUSTER_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub ip: String,
}

/// The local machine's place in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentNode {
    pub name: String,
    pub ip: String,
    /// 1-based position in the topology; node 1 bootstraps the cluster.
    pub ordinal: usize,
}

impl CurrentNode {
    pub fn is_bootstrap(&self) -> bool {
        self.ordinal == 1
    }
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    nodes: Vec<NodeSpec>,
}

/// Three etcd/PostgreSQL nodes in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    nodes: Vec<NodeSpec>,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        let nodes = [
            ("pg-node1", "10.0.0.11"),
            ("pg-node2", "10.0.0.12"),
            ("pg-node3", "10.0.0.13"),
        ]
        .into_iter()
        .map(|(name, ip)| NodeSpec {
            name: name.to_string(),
            ip: ip.to_string(),
        })
        .collect();
        Self { nodes }
    }
}

impl ClusterTopology {
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, BootstrapError> {
        if nodes.len() != CLUSTER_SIZE {
            return Err(BootstrapError::InvalidTopology(format!(
                "expected {CLUSTER_SIZE} nodes, found {}",
                nodes.len()
            )));
        }

        let mut names = HashSet::new();
        let mut ips = HashSet::new();
        for node in &nodes {
            if node.name.is_empty() || node.name.contains(['=', ',', ' ']) {
                return Err(BootstrapError::InvalidTopology(format!(
                    "invalid node name {:?}",
                    node.name
                )));
            }
            let ip: IpAddr = node.ip.parse().map_err(|_| {
                BootstrapError::InvalidTopology(format!(
                    "node {} has invalid IP {:?}",
                    node.name, node.ip
                ))
            })?;
            if !names.insert(node.name.as_str()) {
                return Err(BootstrapError::InvalidTopology(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
            if !ips.insert(ip) {
                return Err(BootstrapError::InvalidTopology(format!(
                    "duplicate node IP {}",
                    node.ip
                )));
            }
        }

        Ok(Self { nodes })
    }

    /// Reads a topology override file:
    ///
    /// ```toml
    /// [[nodes]]
    /// name = "pg-node1"
    /// ip = "10.0.0.11"
    /// ```
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::other(format!("Failed to read {}: {e}", path.display())))?;
        let file: TopologyFile = toml::from_str(&content)
            .map_err(|e| Error::other(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self::new(file.nodes)?)
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn node(&self, ordinal: usize) -> Option<&NodeSpec> {
        ordinal.checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    pub fn resolve(&self, local_ip: &str) -> Result<CurrentNode, BootstrapError> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, node)| node.ip == local_ip)
            .map(|(i, node)| CurrentNode {
                name: node.name.clone(),
                ip: node.ip.clone(),
                ordinal: i + 1,
            })
            .ok_or_else(|| BootstrapError::NodeNotFound {
                ip: local_ip.to_string(),
                known: self
                    .nodes
                    .iter()
                    .map(|n| format!("{}={}", n.name, n.ip))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// `ETCD_INITIAL_CLUSTER` value: the current node first, then the others
    /// in topology order.
    pub fn initial_cluster(&self, current: &CurrentNode) -> String {
        let others = self.nodes.iter().filter(|n| n.name != current.name);
        std::iter::once((current.name.as_str(), current.ip.as_str()))
            .chain(others.map(|n| (n.name.as_str(), n.ip.as_str())))
            .map(|(name, ip)| format!("{name}={}", peer_url(ip)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn peer_url(ip: &str) -> String {
    format!("http://{ip}:{ETCD_PEER_PORT}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn topology() -> ClusterTopology {
        ClusterTopology::new(vec![
            NodeSpec {
                name: "n1".into(),
                ip: "10.1.0.1".into(),
            },
            NodeSpec {
                name: "n2".into(),
                ip: "10.1.0.2".into(),
            },
            NodeSpec {
                name: "n3".into(),
                ip: "10.1.0.3".into(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_every_node() {
        let topology = topology();
        for (i, node) in topology.nodes().iter().enumerate() {
            let current = topology.resolve(&node.ip).unwrap();
            assert_eq!(current.name, node.name);
            assert_eq!(current.ip, node.ip);
            assert_eq!(current.ordinal, i + 1);
        }
        assert!(topology.resolve("10.1.0.1").unwrap().is_bootstrap());
    }

    #[test]
    fn test_resolve_unknown_ip() {
        let err = topology().resolve("192.168.1.9").unwrap_err();
        match &err {
            BootstrapError::NodeNotFound { ip, known } => {
                assert_eq!(ip, "192.168.1.9");
                assert!(known.contains("n2=10.1.0.2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_initial_cluster_puts_current_node_first() {
        let topology = topology();
        let current = topology.resolve("10.1.0.2").unwrap();
        assert_eq!(
            topology.initial_cluster(&current),
            "n2=http://10.1.0.2:2380,n1=http://10.1.0.1:2380,n3=http://10.1.0.3:2380"
        );

        let current = topology.resolve("10.1.0.3").unwrap();
        assert_eq!(
            topology.initial_cluster(&current),
            "n3=http://10.1.0.3:2380,n1=http://10.1.0.1:2380,n2=http://10.1.0.2:2380"
        );
    }

    #[test]
    fn test_initial_cluster_is_deterministic() {
        let topology = topology();
        let current = topology.resolve("10.1.0.1").unwrap();
        let first = topology.initial_cluster(&current);
        assert_eq!(first, topology.initial_cluster(&current));
        assert!(!first.ends_with(','));
        assert_eq!(first.matches(',').count(), 2);
    }

    #[test]
    fn test_rejects_bad_topologies() {
        let node = |name: &str, ip: &str| NodeSpec {
            name: name.into(),
            ip: ip.into(),
        };
        assert!(ClusterTopology::new(vec![node("a", "10.0.0.1"), node("b", "10.0.0.2")]).is_err());
        assert!(
            ClusterTopology::new(vec![
                node("a", "10.0.0.1"),
                node("b", "10.0.0.1"),
                node("c", "10.0.0.3"),
            ])
            .is_err()
        );
        assert!(
            ClusterTopology::new(vec![
                node("a", "10.0.0.1"),
                node("a", "10.0.0.2"),
                node("c", "10.0.0.3"),
            ])
            .is_err()
        );
        assert!(
            ClusterTopology::new(vec![
                node("a", "10.0.0.1"),
                node("b", "not-an-ip"),
                node("c", "10.0.0.3"),
            ])
            .is_err()
        );
    }

    #[test]
    fn test_load_topology_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[nodes]]
name = "db1"
ip = "172.16.0.4"

[[nodes]]
name = "db2"
ip = "172.16.0.5"

[[nodes]]
name = "db3"
ip = "172.16.0.6"
"#
        )
        .unwrap();
        let topology = ClusterTopology::load(file.path()).unwrap();
        assert_eq!(topology.node(3).unwrap().name, "db3");
        assert_eq!(topology.node(0), None);
    }
}
