use crate::common::*;
use crate::topology::{ClusterTopology, CurrentNode, peer_url};
use cmd_lib::*;
use std::fs;
use std::io::{Error, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use strum::{AsRefStr, Display, EnumString};

/// `ETCD_INITIAL_CLUSTER_STATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum InitialClusterState {
    New,
    Existing,
}

/// Contents of the etcd environment file read by `etcd.service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdEnv {
    pub name: String,
    pub data_dir: String,
    pub listen_peer_urls: String,
    pub listen_client_urls: String,
    pub initial_advertise_peer_urls: String,
    pub advertise_client_urls: String,
    pub initial_cluster: String,
    pub initial_cluster_state: InitialClusterState,
    pub initial_cluster_token: String,
    pub heartbeat_interval_ms: u32,
    pub election_timeout_ms: u32,
}

impl EtcdEnv {
    pub fn new(
        topology: &ClusterTopology,
        current: &CurrentNode,
        state: InitialClusterState,
        token: &str,
    ) -> Self {
        let ip = &current.ip;
        Self {
            name: current.name.clone(),
            data_dir: ETCD_DATA_DIR.to_string(),
            listen_peer_urls: peer_url(ip),
            listen_client_urls: format!(
                "http://{ip}:{ETCD_CLIENT_PORT},http://127.0.0.1:{ETCD_CLIENT_PORT}"
            ),
            initial_advertise_peer_urls: peer_url(ip),
            advertise_client_urls: format!("http://{ip}:{ETCD_CLIENT_PORT}"),
            initial_cluster: topology.initial_cluster(current),
            initial_cluster_state: state,
            initial_cluster_token: token.to_string(),
            heartbeat_interval_ms: 100,
            election_timeout_ms: 1000,
        }
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ETCD_NAME", self.name.clone()),
            ("ETCD_DATA_DIR", self.data_dir.clone()),
            ("ETCD_LISTEN_PEER_URLS", self.listen_peer_urls.clone()),
            ("ETCD_LISTEN_CLIENT_URLS", self.listen_client_urls.clone()),
            (
                "ETCD_INITIAL_ADVERTISE_PEER_URLS",
                self.initial_advertise_peer_urls.clone(),
            ),
            ("ETCD_ADVERTISE_CLIENT_URLS", self.advertise_client_urls.clone()),
            ("ETCD_INITIAL_CLUSTER", self.initial_cluster.clone()),
            (
                "ETCD_INITIAL_CLUSTER_STATE",
                self.initial_cluster_state.to_string(),
            ),
            ("ETCD_INITIAL_CLUSTER_TOKEN", self.initial_cluster_token.clone()),
            ("ETCD_HEARTBEAT_INTERVAL", self.heartbeat_interval_ms.to_string()),
            ("ETCD_ELECTION_TIMEOUT", self.election_timeout_ms.to_string()),
        ]
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Managed by pgha-bootstrap\n");
        for (key, value) in self.entries() {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        }
        out
    }
}

/// A systemd unit file with `[Unit]`, `[Service]` and `[Install]` sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemdUnit {
    unit: Vec<(String, String)>,
    service: Vec<(String, String)>,
    install: Vec<(String, String)>,
}

impl SystemdUnit {
    pub fn new(description: &str) -> Self {
        Self::default().unit("Description", description)
    }

    pub fn unit(mut self, key: &str, value: impl ToString) -> Self {
        self.unit.push((key.to_string(), value.to_string()));
        self
    }

    pub fn service(mut self, key: &str, value: impl ToString) -> Self {
        self.service.push((key.to_string(), value.to_string()));
        self
    }

    pub fn install(mut self, key: &str, value: impl ToString) -> Self {
        self.install.push((key.to_string(), value.to_string()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, entries) in [
            ("Unit", &self.unit),
            ("Service", &self.service),
            ("Install", &self.install),
        ] {
            if entries.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{name}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }
}

pub fn etcd_unit(etcd_bin: &str) -> SystemdUnit {
    SystemdUnit::new("etcd distributed key-value store")
        .unit("Documentation", "https://etcd.io/docs/")
        .unit("After", "network-online.target")
        .unit("Wants", "network-online.target")
        .service("Type", "notify")
        .service("User", ETCD_USER)
        .service("Group", ETCD_USER)
        .service("EnvironmentFile", ETCD_CONF_FILE)
        .service("ExecStart", etcd_bin)
        .service("Restart", "on-failure")
        .service("RestartSec", 5)
        .service("LimitNOFILE", 65536)
        .service("TimeoutStartSec", 0)
        .install("WantedBy", "multi-user.target")
}

pub fn patroni_unit(patroni_bin: &str) -> SystemdUnit {
    SystemdUnit::new("Patroni PostgreSQL high-availability manager")
        .unit("Documentation", "https://patroni.readthedocs.io/")
        .unit("After", "syslog.target network-online.target")
        .unit("Wants", "network-online.target")
        .service("Type", "simple")
        .service("User", POSTGRES_USER)
        .service("Group", POSTGRES_USER)
        .service("ExecStart", format!("{patroni_bin} {PATRONI_CONF_FILE}"))
        .service("ExecReload", "/bin/kill -s HUP $MAINPID")
        .service("KillMode", "process")
        .service("TimeoutSec", 30)
        .service("Restart", "on-failure")
        .service("LimitNOFILE", 65536)
        .install("WantedBy", "multi-user.target")
}

/// Writes `content` to `path` under `root`, replacing whatever is there.
/// The file is created with `mode` so secrets are never world readable.
pub fn write_file(root: &Path, path: &str, content: &str, mode: u32) -> CmdResult {
    let target = resolve(root, path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::other(format!("Failed to create {}: {e}", parent.display())))?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(&target)
        .map_err(|e| Error::other(format!("Failed to open {}: {e}", target.display())))?;
    // Existing files keep their old mode on open.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::other(format!("Failed to write {}: {e}", target.display())))?;
    file.sync_all()?;

    info!("Wrote {} (mode {mode:o})", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeSpec;

    fn topology() -> ClusterTopology {
        ClusterTopology::new(
            [("pg1", "10.0.0.11"), ("pg2", "10.0.0.12"), ("pg3", "10.0.0.13")]
                .into_iter()
                .map(|(name, ip)| NodeSpec {
                    name: name.into(),
                    ip: ip.into(),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_etcd_env_render() {
        let topology = topology();
        let current = topology.resolve("10.0.0.12").unwrap();
        let env = EtcdEnv::new(&topology, &current, InitialClusterState::New, "tok");
        let text = env.render();
        assert!(text.contains("ETCD_NAME=\"pg2\"\n"));
        assert!(text.contains("ETCD_LISTEN_PEER_URLS=\"http://10.0.0.12:2380\"\n"));
        assert!(text.contains(
            "ETCD_LISTEN_CLIENT_URLS=\"http://10.0.0.12:2379,http://127.0.0.1:2379\"\n"
        ));
        assert!(text.contains(
            "ETCD_INITIAL_CLUSTER=\"pg2=http://10.0.0.12:2380,pg1=http://10.0.0.11:2380,pg3=http://10.0.0.13:2380\"\n"
        ));
        assert!(text.contains("ETCD_INITIAL_CLUSTER_STATE=\"new\"\n"));
        assert!(text.contains("ETCD_INITIAL_CLUSTER_TOKEN=\"tok\"\n"));
        for line in text.lines().skip(1) {
            let (key, value) = line.split_once('=').unwrap();
            assert!(key.starts_with("ETCD_"));
            assert!(value.starts_with('"') && value.ends_with('"'));
        }
    }

    #[test]
    fn test_existing_cluster_state() {
        let topology = topology();
        let current = topology.resolve("10.0.0.13").unwrap();
        let env = EtcdEnv::new(&topology, &current, InitialClusterState::Existing, "tok");
        assert!(env.render().contains("ETCD_INITIAL_CLUSTER_STATE=\"existing\""));
    }

    #[test]
    fn test_etcd_unit_render() {
        let text = etcd_unit("/usr/local/bin/etcd").render();
        assert!(text.starts_with("[Unit]\nDescription=etcd distributed key-value store\n"));
        assert!(text.contains("\n\n[Service]\nType=notify\n"));
        assert!(text.contains("EnvironmentFile=/etc/etcd/etcd.conf\n"));
        assert!(text.contains("ExecStart=/usr/local/bin/etcd\n"));
        assert!(text.contains("Restart=on-failure\n"));
        assert!(text.contains("LimitNOFILE=65536\n"));
        assert!(text.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_patroni_unit_render() {
        let text = patroni_unit("/usr/bin/patroni").render();
        assert!(text.contains("ExecStart=/usr/bin/patroni /etc/patroni/patroni.yml\n"));
        assert!(text.contains("User=postgres\n"));
        assert!(text.contains("KillMode=process\n"));
    }

    #[test]
    fn test_write_file_sets_mode_and_overwrites() {
        let root = tempfile::tempdir().unwrap();
        write_file(root.path(), "/etc/patroni/patroni.yml", "old", MODE_PUBLIC).unwrap();
        write_file(root.path(), "/etc/patroni/patroni.yml", "new", MODE_SECRET).unwrap();

        let path = root.path().join("etc/patroni/patroni.yml");
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
