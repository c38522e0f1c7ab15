//! Typed model of `patroni.yml`.
//!
//! Only the sections this tool manages are modelled. Field names follow the
//! Patroni configuration reference so that the serialized document can be
//! handed to the daemon verbatim.

use crate::common::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Error;

/// Everything needed to render one node's Patroni configuration.
#[derive(Debug, Clone)]
pub struct PatroniBootstrapSpec {
    pub scope: String,
    pub node_name: String,
    pub node_ip: String,
    pub etcd_hosts: Vec<String>,
    pub postgres_version: String,
    pub bin_dir: String,
    pub superuser_password: String,
    pub replicator_password: String,
    pub rewind_password: String,
    pub restapi_password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatroniConfig {
    pub scope: String,
    pub namespace: String,
    pub name: String,
    pub restapi: RestApi,
    pub etcd3: Etcd3,
    pub bootstrap: Bootstrap,
    pub postgresql: Postgresql,
    pub watchdog: Watchdog,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestApi {
    pub listen: String,
    pub connect_address: String,
    pub authentication: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Etcd3 {
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bootstrap {
    pub dcs: Dcs,
    pub initdb: Vec<InitdbOption>,
    pub pg_hba: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dcs {
    pub ttl: u32,
    pub loop_wait: u32,
    pub retry_timeout: u32,
    pub maximum_lag_on_failover: u64,
    pub postgresql: DcsPostgresql,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DcsPostgresql {
    pub use_pg_rewind: bool,
    pub use_slots: bool,
    pub parameters: BTreeMap<String, Setting>,
}

/// A `postgresql.conf` value; Patroni accepts both numbers and strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Setting {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for Setting {
    fn from(v: bool) -> Self {
        Setting::Bool(v)
    }
}

impl From<i64> for Setting {
    fn from(v: i64) -> Self {
        Setting::Int(v)
    }
}

impl From<&str> for Setting {
    fn from(v: &str) -> Self {
        Setting::Text(v.to_string())
    }
}

/// `initdb` takes a list mixing bare flags and `key: value` pairs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InitdbOption {
    Flag(String),
    Setting(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Postgresql {
    pub listen: String,
    pub connect_address: String,
    pub data_dir: String,
    pub bin_dir: String,
    pub pgpass: String,
    pub authentication: Authentication,
    pub parameters: BTreeMap<String, Setting>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Authentication {
    pub replication: Credentials,
    pub superuser: Credentials,
    pub rewind: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watchdog {
    pub mode: String,
    pub device: String,
    pub safety_margin: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tags {
    pub nofailover: bool,
    pub noloadbalance: bool,
    pub clonefrom: bool,
    pub nosync: bool,
}

pub const SUPERUSER: &str = "postgres";
pub const REPLICATOR: &str = "replicator";
pub const REWIND_USER: &str = "rewind_user";
pub const RESTAPI_USER: &str = "patroni";

fn tuning_parameters() -> BTreeMap<String, Setting> {
    let params: [(&str, Setting); 18] = [
        ("max_connections", Setting::Int(200)),
        ("shared_buffers", "2GB".into()),
        ("effective_cache_size", "6GB".into()),
        ("maintenance_work_mem", "512MB".into()),
        ("work_mem", "16MB".into()),
        ("checkpoint_completion_target", "0.9".into()),
        ("wal_buffers", "16MB".into()),
        ("min_wal_size", "1GB".into()),
        ("max_wal_size", "4GB".into()),
        ("random_page_cost", "1.1".into()),
        ("effective_io_concurrency", Setting::Int(200)),
        ("wal_level", "replica".into()),
        ("hot_standby", true.into()),
        ("wal_log_hints", true.into()),
        ("max_wal_senders", Setting::Int(10)),
        ("max_replication_slots", Setting::Int(10)),
        ("wal_keep_size", "1GB".into()),
        ("password_encryption", "scram-sha-256".into()),
    ];
    params
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl PatroniConfig {
    pub fn new(spec: &PatroniBootstrapSpec) -> Self {
        let ip = &spec.node_ip;
        let credentials = |username: &str, password: &str| Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };

        let mut encoding = BTreeMap::new();
        encoding.insert("encoding".to_string(), "UTF8".to_string());

        let mut local_parameters = BTreeMap::new();
        local_parameters.insert(
            "unix_socket_directories".to_string(),
            Setting::from("/var/run/postgresql"),
        );

        Self {
            scope: spec.scope.clone(),
            namespace: "/service/".to_string(),
            name: spec.node_name.clone(),
            restapi: RestApi {
                listen: format!("0.0.0.0:{PATRONI_REST_PORT}"),
                connect_address: format!("{ip}:{PATRONI_REST_PORT}"),
                authentication: credentials(RESTAPI_USER, &spec.restapi_password),
            },
            etcd3: Etcd3 {
                hosts: spec.etcd_hosts.clone(),
            },
            bootstrap: Bootstrap {
                dcs: Dcs {
                    ttl: 30,
                    loop_wait: 10,
                    retry_timeout: 10,
                    maximum_lag_on_failover: 1_048_576,
                    postgresql: DcsPostgresql {
                        use_pg_rewind: true,
                        use_slots: true,
                        parameters: tuning_parameters(),
                    },
                },
                initdb: vec![
                    InitdbOption::Setting(encoding),
                    InitdbOption::Flag("data-checksums".to_string()),
                ],
                pg_hba: vec![
                    "local all all peer".to_string(),
                    "host replication replicator 127.0.0.1/32 scram-sha-256".to_string(),
                    "host replication replicator 0.0.0.0/0 scram-sha-256".to_string(),
                    "host all all 127.0.0.1/32 scram-sha-256".to_string(),
                    "host all all 0.0.0.0/0 scram-sha-256".to_string(),
                ],
            },
            postgresql: Postgresql {
                listen: format!("0.0.0.0:{POSTGRES_PORT}"),
                connect_address: format!("{ip}:{POSTGRES_PORT}"),
                data_dir: format!("{PATRONI_DATA_DIR}/{}/data", spec.postgres_version),
                bin_dir: spec.bin_dir.clone(),
                pgpass: "/tmp/pgpass0".to_string(),
                authentication: Authentication {
                    replication: credentials(REPLICATOR, &spec.replicator_password),
                    superuser: credentials(SUPERUSER, &spec.superuser_password),
                    rewind: credentials(REWIND_USER, &spec.rewind_password),
                },
                parameters: local_parameters,
            },
            watchdog: Watchdog {
                mode: "automatic".to_string(),
                device: "/dev/watchdog".to_string(),
                safety_margin: 5,
            },
            tags: Tags {
                nofailover: false,
                noloadbalance: false,
                clonefrom: false,
                nosync: false,
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::other(format!("Failed to serialize patroni config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn spec() -> PatroniBootstrapSpec {
        PatroniBootstrapSpec {
            scope: "pg-prod".to_string(),
            node_name: "pg-node2".to_string(),
            node_ip: "10.0.0.12".to_string(),
            etcd_hosts: vec![
                "10.0.0.11:2379".to_string(),
                "10.0.0.12:2379".to_string(),
                "10.0.0.13:2379".to_string(),
            ],
            postgres_version: "16".to_string(),
            bin_dir: "/usr/lib/postgresql/16/bin".to_string(),
            superuser_password: "super-pw".to_string(),
            replicator_password: "repl-pw".to_string(),
            rewind_password: "rewind-pw".to_string(),
            restapi_password: "api-pw".to_string(),
        }
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = PatroniConfig::new(&spec()).to_yaml().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["scope"].as_str(), Some("pg-prod"));
        assert_eq!(doc["name"].as_str(), Some("pg-node2"));
        assert_eq!(doc["restapi"]["connect_address"].as_str(), Some("10.0.0.12:8008"));
        assert_eq!(doc["restapi"]["authentication"]["password"].as_str(), Some("api-pw"));
        assert_eq!(doc["etcd3"]["hosts"][2].as_str(), Some("10.0.0.13:2379"));

        let params = &doc["bootstrap"]["dcs"]["postgresql"]["parameters"];
        assert_eq!(params["max_connections"].as_i64(), Some(200));
        assert_eq!(params["wal_level"].as_str(), Some("replica"));
        assert_eq!(params["password_encryption"].as_str(), Some("scram-sha-256"));

        let auth = &doc["postgresql"]["authentication"];
        assert_eq!(auth["superuser"]["username"].as_str(), Some("postgres"));
        assert_eq!(auth["superuser"]["password"].as_str(), Some("super-pw"));
        assert_eq!(auth["replication"]["username"].as_str(), Some("replicator"));
        assert_eq!(auth["rewind"]["password"].as_str(), Some("rewind-pw"));

        assert_eq!(doc["postgresql"]["data_dir"].as_str(), Some("/var/lib/patroni/16/data"));
        assert_eq!(doc["watchdog"]["mode"].as_str(), Some("automatic"));
        assert_eq!(doc["tags"]["nofailover"].as_bool(), Some(false));
    }

    #[test]
    fn test_initdb_mixes_maps_and_flags() {
        let yaml = PatroniConfig::new(&spec()).to_yaml().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let initdb = doc["bootstrap"]["initdb"].as_sequence().unwrap();
        assert_eq!(initdb[0]["encoding"].as_str(), Some("UTF8"));
        assert_eq!(initdb[1].as_str(), Some("data-checksums"));
    }

    #[test]
    fn test_awkward_passwords_survive_serialization() {
        let mut spec = spec();
        spec.superuser_password = "a: b # 'c\"".to_string();
        let yaml = PatroniConfig::new(&spec).to_yaml().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            doc["postgresql"]["authentication"]["superuser"]["password"].as_str(),
            Some("a: b # 'c\"")
        );
    }
}
