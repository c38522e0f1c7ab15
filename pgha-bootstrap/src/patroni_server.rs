use crate::advisor::patroni_next_steps;
use crate::common::*;
use crate::confirm::{Summary, confirm};
use crate::error::BootstrapError;
use crate::password::password_or_generate;
use crate::patroni_config::{PatroniBootstrapSpec, PatroniConfig};
use crate::render::{patroni_unit, write_file};
use crate::step::Step;
use cmd_lib::*;
use serde::Deserialize;
use std::io::Error;
use std::net::IpAddr;

const PGDG_KEY_URL: &str = "https://www.postgresql.org/media/keys/ACCC4CF8.asc";
const PGDG_KEY_FILE: &str = "/usr/share/postgresql-common/pgdg/apt.postgresql.org.asc";
const PGDG_APT_LIST: &str = "/etc/apt/sources.list.d/pgdg.list";
const PATRONI_BIN: &str = "/usr/bin/patroni";

#[derive(Debug, clap::Args)]
pub struct PatroniArgs {
    #[arg(short = 'n', long)]
    pub node_name: String,

    #[arg(short = 'i', long)]
    pub node_ip: String,

    #[arg(
        short = 'e',
        long,
        value_delimiter = ',',
        required = true,
        help = "Comma separated etcd client endpoints, e.g. 10.0.0.11:2379,10.0.0.12:2379"
    )]
    pub etcd_hosts: Vec<String>,

    #[arg(short = 'c', long, default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    #[arg(short = 's', long, help = "Patroni scope (defaults to the cluster name)")]
    pub scope: Option<String>,

    #[arg(short = 'p', long = "postgres-ver", default_value = POSTGRES_VERSION)]
    pub postgres_version: String,

    #[arg(short = 'u', long = "superuser", help = "Superuser password (generated if omitted)")]
    pub superuser_password: Option<String>,

    #[arg(short = 'r', long = "replicator", help = "Replication password (generated if omitted)")]
    pub replicator_password: Option<String>,

    #[arg(long, help = "pg_rewind user password (generated if omitted)")]
    pub rewind_password: Option<String>,

    #[arg(long, help = "Patroni REST API password (generated if omitted)")]
    pub restapi_password: Option<String>,

    #[arg(long, help = "Print passwords in the summary instead of masking them")]
    pub show_secrets: bool,
}

/// Where the distribution puts things once the packages are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub bin_dir: String,
    pub default_service: String,
    /// Makes the PGDG repository's signing key or repo package available.
    pub repo_steps: Vec<Step>,
    /// `(path, content)` of the apt source list, written after `repo_steps`
    /// because apt rejects a signed-by source whose key is missing.
    pub apt_source: Option<(String, String)>,
    pub install_steps: Vec<Step>,
}

pub fn install_plan(os: &OsRelease, version: &str, machine: &str) -> Result<InstallPlan, Error> {
    match os.package_manager {
        PackageManager::Apt => {
            let codename = os.codename.as_deref().ok_or_else(|| {
                BootstrapError::UnsupportedOs(format!(
                    "{} {} (no VERSION_CODENAME in /etc/os-release)",
                    os.id, os.version_id
                ))
            })?;
            let key_dir = PGDG_KEY_FILE.rsplit_once('/').map_or("/", |(dir, _)| dir);
            let source = format!(
                "deb [signed-by={PGDG_KEY_FILE}] https://apt.postgresql.org/pub/repos/apt {codename}-pgdg main\n"
            );
            let postgres_pkg = format!("postgresql-{version}");
            Ok(InstallPlan {
                bin_dir: format!("/usr/lib/postgresql/{version}/bin"),
                default_service: "postgresql".to_string(),
                apt_source: Some((PGDG_APT_LIST.to_string(), source)),
                repo_steps: vec![
                    Step::new("Refreshing package index", "apt-get").arg("update"),
                    Step::new("Installing repository prerequisites", "apt-get").args(&[
                        "install",
                        "-y",
                        "curl",
                        "ca-certificates",
                        "gnupg",
                    ]),
                    Step::new("Creating PGDG key directory", "install").args(&["-d", key_dir]),
                    Step::new("Fetching PGDG signing key", "curl").args(&[
                        "-fsSL",
                        "-o",
                        PGDG_KEY_FILE,
                        PGDG_KEY_URL,
                    ]),
                ],
                install_steps: vec![
                    Step::new("Refreshing package index with PGDG", "apt-get").arg("update"),
                    Step::new(format!("Installing PostgreSQL {version} and Patroni"), "apt-get")
                        .args(&[
                            "install",
                            "-y",
                            postgres_pkg.as_str(),
                            "patroni",
                            "python3-etcd",
                            "python3-psycopg2",
                        ]),
                ],
            })
        }
        PackageManager::Dnf => {
            let major = os.version_id.split('.').next().unwrap_or_default();
            let repo_rpm = if os.id == "fedora" {
                format!(
                    "https://download.postgresql.org/pub/repos/yum/reporpms/F-{major}-{machine}/pgdg-fedora-repo-latest.noarch.rpm"
                )
            } else {
                format!(
                    "https://download.postgresql.org/pub/repos/yum/reporpms/EL-{major}-{machine}/pgdg-redhat-repo-latest.noarch.rpm"
                )
            };
            let server_pkg = format!("postgresql{version}-server");
            let contrib_pkg = format!("postgresql{version}-contrib");
            Ok(InstallPlan {
                bin_dir: format!("/usr/pgsql-{version}/bin"),
                default_service: format!("postgresql-{version}"),
                apt_source: None,
                repo_steps: vec![
                    Step::new("Installing PGDG repository", "dnf").args(&[
                        "install",
                        "-y",
                        repo_rpm.as_str(),
                    ]),
                    Step::new("Disabling the built-in PostgreSQL module", "dnf")
                        .args(&["-qy", "module", "disable", "postgresql"])
                        .tolerated(),
                ],
                install_steps: vec![
                    Step::new(format!("Installing PostgreSQL {version} and Patroni"), "dnf").args(
                        &[
                            "install",
                            "-y",
                            server_pkg.as_str(),
                            contrib_pkg.as_str(),
                            "patroni",
                            "patroni-etcd",
                        ],
                    ),
                ],
            })
        }
    }
}

/// Checks the flag values and appends the default client port to bare etcd hosts.
pub fn validate(args: &PatroniArgs) -> Result<Vec<String>, BootstrapError> {
    let invalid = |msg: String| Err(BootstrapError::InvalidArgument(msg));

    if args.node_name.is_empty()
        || !args
            .node_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid(format!(
            "node name {:?} may only contain letters, digits, '-', '_' and '.'",
            args.node_name
        ));
    }
    if args.node_ip.parse::<IpAddr>().is_err() {
        return invalid(format!("node IP {:?} is not a valid IP address", args.node_ip));
    }
    if args.postgres_version.is_empty() || !args.postgres_version.chars().all(|c| c.is_ascii_digit()) {
        return invalid(format!(
            "PostgreSQL version {:?} must be a major version number such as 16",
            args.postgres_version
        ));
    }
    if args.scope.as_deref().unwrap_or(&args.cluster_name).is_empty() {
        return invalid("scope must not be empty".to_string());
    }

    let mut hosts = Vec::new();
    for host in args.etcd_hosts.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
        match host.rsplit_once(':') {
            Some((name, port)) => {
                if name.is_empty() || port.parse::<u16>().is_err() {
                    return invalid(format!("etcd host {host:?} is not of the form host:port"));
                }
                hosts.push(host.to_string());
            }
            None => hosts.push(format!("{host}:{ETCD_CLIENT_PORT}")),
        }
    }
    if hosts.is_empty() {
        return invalid("at least one etcd host is required".to_string());
    }
    Ok(hosts)
}

pub fn bootstrap(session: &mut Session, args: &PatroniArgs) -> CmdResult {
    info!("Starting PostgreSQL/Patroni bootstrap for {}", args.node_name);

    require_root(session.runner, "patroni")?;
    let os = detect_os(&session.root)?;
    info!(
        "Detected {} {} ({})",
        os.id, os.version_id, os.package_manager
    );
    let etcd_hosts = validate(args)?;
    let machine = session.runner.output(&Step::query("uname", &["-m"]))?;
    let plan = install_plan(&os, &args.postgres_version, machine.trim())?;

    let (superuser_password, superuser_generated) =
        password_or_generate(args.superuser_password.as_deref(), "superuser")?;
    let (replicator_password, replicator_generated) =
        password_or_generate(args.replicator_password.as_deref(), "replicator")?;
    let (restapi_password, restapi_generated) =
        password_or_generate(args.restapi_password.as_deref(), "REST API")?;
    let (rewind_password, rewind_generated) =
        password_or_generate(args.rewind_password.as_deref(), "rewind")?;

    let spec = PatroniBootstrapSpec {
        scope: args.scope.clone().unwrap_or_else(|| args.cluster_name.clone()),
        node_name: args.node_name.clone(),
        node_ip: args.node_ip.clone(),
        etcd_hosts,
        postgres_version: args.postgres_version.clone(),
        bin_dir: plan.bin_dir.clone(),
        superuser_password,
        replicator_password,
        rewind_password,
        restapi_password,
    };
    let config = PatroniConfig::new(&spec);
    let yaml = config.to_yaml()?;

    let summary = Summary::new("PostgreSQL/Patroni configuration")
        .show_secrets(args.show_secrets)
        .row("Node name", &spec.node_name)
        .row("Node IP", &spec.node_ip)
        .row("Cluster name", &args.cluster_name)
        .row("Scope", &spec.scope)
        .row("PostgreSQL version", &spec.postgres_version)
        .row("Operating system", format!("{} {}", os.id, os.version_id))
        .row("etcd hosts", spec.etcd_hosts.join(","))
        .row("Data directory", &config.postgresql.data_dir)
        .row("Config file", PATRONI_CONF_FILE)
        .secret("Superuser password", &spec.superuser_password, superuser_generated)
        .secret("Replicator password", &spec.replicator_password, replicator_generated)
        .secret("Rewind password", &spec.rewind_password, rewind_generated)
        .secret("REST API password", &spec.restapi_password, restapi_generated);
    if !confirm(&summary, session.input, session.output)? {
        info!("Aborted by operator, nothing was changed");
        return Ok(());
    }

    session.runner.run_all(&plan.repo_steps)?;
    if let Some((path, content)) = &plan.apt_source {
        info!("Adding PGDG apt repository");
        write_file(&session.root, path, content, MODE_PUBLIC)?;
    }
    session.runner.run_all(&plan.install_steps)?;

    session.runner.run_all(&[
        Step::new(format!("Stopping default {} service", plan.default_service), "systemctl")
            .args(&["stop", plan.default_service.as_str()])
            .tolerated(),
        Step::new(format!("Disabling default {} service", plan.default_service), "systemctl")
            .args(&["disable", plan.default_service.as_str()])
            .tolerated(),
    ])?;

    ensure_owned_dir(session, PATRONI_DATA_DIR, POSTGRES_USER, "700")?;

    info!("Writing Patroni config to {PATRONI_CONF_FILE}");
    write_file(&session.root, PATRONI_CONF_FILE, &yaml, MODE_SECRET)?;
    let conf_path = session.path(PATRONI_CONF_FILE).to_string_lossy().into_owned();
    let owner = format!("{POSTGRES_USER}:{POSTGRES_USER}");
    session.runner.run(
        &Step::new(format!("Setting owner of {conf_path} to {owner}"), "chown").args(&[
            owner.as_str(),
            conf_path.as_str(),
        ]),
    )?;

    info!("Creating patroni systemd service");
    write_file(
        &session.root,
        &systemd_unit_path("patroni"),
        &patroni_unit(PATRONI_BIN).render(),
        MODE_PUBLIC,
    )?;
    enable_service_stopped(session.runner, "patroni")?;

    check_etcd_connectivity(session, &spec.etcd_hosts);

    let mut generated = Vec::new();
    if superuser_generated {
        generated.push(("superuser", spec.superuser_password.as_str()));
    }
    if replicator_generated {
        generated.push(("replicator", spec.replicator_password.as_str()));
    }
    if rewind_generated {
        generated.push(("rewind", spec.rewind_password.as_str()));
    }
    if restapi_generated {
        generated.push(("restapi", spec.restapi_password.as_str()));
    }
    patroni_next_steps(&spec, &generated).write_to("Next steps", session.output)?;
    info!("Patroni bootstrap complete, service is enabled but not started");
    Ok(())
}

/// Body of etcd's `/health` endpoint.
#[derive(Debug, Deserialize)]
struct EtcdHealth {
    health: String,
    #[serde(default)]
    reason: String,
}

/// Reports which etcd endpoints answer; an unreachable endpoint is only a warning.
fn check_etcd_connectivity(session: &mut Session, hosts: &[String]) {
    for host in hosts {
        let url = format!("http://{host}/health");
        let body = match session
            .runner
            .capture(&Step::query("curl", &["-s", "--max-time", "5", url.as_str()]))
        {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not reach etcd at {host}: {e}");
                continue;
            }
        };
        match serde_json::from_str::<EtcdHealth>(&body) {
            Ok(h) if h.health == "true" => info!("etcd at {host} is healthy"),
            Ok(h) => warn!("etcd at {host} reports unhealthy: {}", h.reason),
            Err(_) => warn!("etcd at {host} did not return a health report: {:?}", body.trim()),
        }
    }
}
