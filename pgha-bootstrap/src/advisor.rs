use crate::azure_lb::{LbRole, LoadBalancerSpec};
use crate::common::*;
use crate::patroni_config::PatroniBootstrapSpec;
use crate::topology::{ClusterTopology, CurrentNode, peer_url};
use crate::workflow::ClusterState;
use colored::*;
use std::io::{Result, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advice {
    Steps(Vec<String>),
    /// The next steps depend on a transition that has not been recorded yet.
    Blocked(String),
    Done(String),
}

impl Advice {
    pub fn write_to(&self, title: &str, out: &mut dyn Write) -> Result<()> {
        writeln!(out)?;
        writeln!(out, "{}", format!("=== {title} ===").bold())?;
        match self {
            Advice::Steps(steps) => {
                for (i, step) in steps.iter().enumerate() {
                    writeln!(out, "  {}. {step}", i + 1)?;
                }
            }
            Advice::Blocked(reason) => writeln!(out, "  {} {reason}", "WAITING:".yellow().bold())?,
            Advice::Done(note) => writeln!(out, "  {note}")?,
        }
        writeln!(out)?;
        Ok(())
    }
}

fn client_endpoint(ip: &str) -> String {
    format!("http://{ip}:{ETCD_CLIENT_PORT}")
}

fn advance_hint(state: ClusterState) -> String {
    format!("Record the progress: pgha-bootstrap cluster advance {state}")
}

/// What the operator does next for the member `current`, given how far the
/// cluster has progressed.
pub fn etcd_next_steps(
    topology: &ClusterTopology,
    current: &CurrentNode,
    state: ClusterState,
) -> Advice {
    if state.has_member(current.ordinal) {
        return Advice::Done(format!(
            "{} is already recorded as a cluster member (state: {state}); nothing left to do on this node",
            current.name
        ));
    }

    let conf = ETCD_CONF_FILE;
    if current.is_bootstrap() {
        let endpoint = client_endpoint(&current.ip);
        return Advice::Steps(vec![
            format!(
                "Bootstrap a single member cluster: set ETCD_INITIAL_CLUSTER=\"{}={}\" in {conf}",
                current.name,
                peer_url(&current.ip)
            ),
            "Start etcd: sudo systemctl start etcd".to_string(),
            format!("Check health: etcdctl --endpoints={endpoint} endpoint health"),
            advance_hint(ClusterState::Node1Started),
        ]);
    }

    let previous = current.ordinal - 1;
    if !state.has_member(previous) {
        let name = topology
            .node(previous)
            .map(|n| n.name.as_str())
            .unwrap_or("the previous node");
        let required = if previous == 1 {
            ClusterState::Node1Started
        } else {
            ClusterState::Node2Joined
        };
        return Advice::Blocked(format!(
            "node {previous} ({name}) is not recorded as part of the cluster yet (state: {state}). \
             Finish node {previous} first and run `pgha-bootstrap cluster advance {}`, then re-run \
             `pgha-bootstrap cluster status` for the node {} instructions",
            required,
            current.ordinal
        ));
    }

    let existing: Vec<String> = topology
        .nodes()
        .iter()
        .enumerate()
        .filter(|(i, _)| state.has_member(i + 1))
        .map(|(_, n)| client_endpoint(&n.ip))
        .collect();
    let mut members: Vec<String> = topology
        .nodes()
        .iter()
        .enumerate()
        .filter(|(i, _)| state.has_member(i + 1))
        .map(|(_, n)| format!("{}={}", n.name, peer_url(&n.ip)))
        .collect();
    members.push(format!("{}={}", current.name, peer_url(&current.ip)));

    let joined = if current.ordinal == 2 {
        ClusterState::Node2Joined
    } else {
        ClusterState::Node3Joined
    };
    let mut steps = vec![
        format!(
            "On an existing member run: etcdctl --endpoints={} member add {} --peer-urls={}",
            existing.join(","),
            current.name,
            peer_url(&current.ip)
        ),
        format!(
            "On this node edit {conf}: ETCD_INITIAL_CLUSTER_STATE=\"existing\" and ETCD_INITIAL_CLUSTER=\"{}\"",
            members.join(",")
        ),
        "Start etcd: sudo systemctl start etcd".to_string(),
        format!(
            "Verify membership: etcdctl --endpoints={} member list",
            client_endpoint(&current.ip)
        ),
        advance_hint(joined),
    ];
    if joined == ClusterState::Node3Joined {
        steps.push(advance_hint(ClusterState::Complete));
    }
    Advice::Steps(steps)
}

pub fn patroni_next_steps(
    spec: &PatroniBootstrapSpec,
    generated: &[(&str, &str)],
) -> Advice {
    let endpoints = spec
        .etcd_hosts
        .iter()
        .map(|h| format!("http://{h}"))
        .collect::<Vec<_>>()
        .join(",");
    let mut steps = vec![
        format!("Make sure etcd is healthy: etcdctl --endpoints={endpoints} endpoint health"),
        "Start Patroni on the first node only and wait until it is the leader: sudo systemctl start patroni"
            .to_string(),
        format!("Check the cluster: patronictl -c {PATRONI_CONF_FILE} list {}", spec.scope),
        "Then start Patroni on the remaining nodes one at a time".to_string(),
        format!(
            "Check this node's role: curl -s http://{}:{PATRONI_REST_PORT}/health",
            spec.node_ip
        ),
    ];
    if !generated.is_empty() {
        let creds = generated
            .iter()
            .map(|(what, pw)| format!("{what}={pw}"))
            .collect::<Vec<_>>()
            .join(", ");
        steps.push(format!(
            "Store the generated credentials ({creds}); every node must use the same values"
        ));
    }
    Advice::Steps(steps)
}

pub fn azure_lb_next_steps(specs: &[LoadBalancerSpec]) -> Advice {
    let mut steps = Vec::new();
    for spec in specs {
        let what = match spec.role {
            LbRole::Write => "primary (read/write)",
            LbRole::Read => "replicas (read only)",
        };
        steps.push(format!(
            "Connect to the {what}: psql -h {} -p {} -U {POSTGRES_USER}",
            spec.frontend_ip.address, spec.rule.frontend_port
        ));
        steps.push(format!(
            "Watch probe state: az network lb show -g {} -n {} --query backendAddressPools",
            spec.resource_group, spec.name
        ));
        steps.push(format!(
            "Only nodes answering 200 on http://<node>:{}{} receive {} traffic",
            spec.probe.port,
            spec.probe.path,
            spec.role.as_ref()
        ));
    }
    Advice::Steps(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeSpec;

    fn topology() -> ClusterTopology {
        ClusterTopology::new(
            [("n1", "10.0.0.1"), ("n2", "10.0.0.2"), ("n3", "10.0.0.3")]
                .into_iter()
                .map(|(name, ip)| NodeSpec {
                    name: name.into(),
                    ip: ip.into(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn steps(advice: Advice) -> Vec<String> {
        match advice {
            Advice::Steps(steps) => steps,
            other => panic!("expected steps, got {other:?}"),
        }
    }

    #[test]
    fn test_node1_bootstraps() {
        let topology = topology();
        let node1 = topology.resolve("10.0.0.1").unwrap();
        let steps = steps(etcd_next_steps(&topology, &node1, ClusterState::New));
        assert!(steps[0].contains("ETCD_INITIAL_CLUSTER=\"n1=http://10.0.0.1:2380\""));
        assert!(steps.iter().any(|s| s.contains("systemctl start etcd")));
        assert!(steps.last().unwrap().ends_with("advance node1-started"));
    }

    #[test]
    fn test_node2_waits_for_node1() {
        let topology = topology();
        let node2 = topology.resolve("10.0.0.2").unwrap();
        match etcd_next_steps(&topology, &node2, ClusterState::New) {
            Advice::Blocked(reason) => {
                assert!(reason.contains("node 1 (n1)"));
                assert!(reason.contains("advance node1-started"));
            }
            other => panic!("expected blocked, got {other:?}"),
        }

        let steps = steps(etcd_next_steps(&topology, &node2, ClusterState::Node1Started));
        assert_eq!(
            steps[0],
            "On an existing member run: etcdctl --endpoints=http://10.0.0.1:2379 member add n2 --peer-urls=http://10.0.0.2:2380"
        );
        assert!(steps[1].contains("ETCD_INITIAL_CLUSTER_STATE=\"existing\""));
        assert!(steps[1].contains("n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380\""));
    }

    #[test]
    fn test_node3_refused_until_node2_joined() {
        let topology = topology();
        let node3 = topology.resolve("10.0.0.3").unwrap();
        for state in [ClusterState::New, ClusterState::Node1Started] {
            assert!(matches!(
                etcd_next_steps(&topology, &node3, state),
                Advice::Blocked(_)
            ));
        }

        let steps = steps(etcd_next_steps(&topology, &node3, ClusterState::Node2Joined));
        assert!(steps[0].contains("--endpoints=http://10.0.0.1:2379,http://10.0.0.2:2379"));
        assert!(steps[0].contains("member add n3"));
        assert!(steps.last().unwrap().ends_with("advance complete"));
    }

    #[test]
    fn test_joined_member_has_nothing_to_do() {
        let topology = topology();
        let node2 = topology.resolve("10.0.0.2").unwrap();
        assert!(matches!(
            etcd_next_steps(&topology, &node2, ClusterState::Node3Joined),
            Advice::Done(_)
        ));
    }

    #[test]
    fn test_advice_rendering() {
        let mut out = Vec::<u8>::new();
        Advice::Steps(vec!["first".into(), "second".into()])
            .write_to("Next steps", &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("  1. first\n"));
        assert!(text.contains("  2. second\n"));
    }
}
