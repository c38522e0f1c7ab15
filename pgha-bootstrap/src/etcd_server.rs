use crate::advisor::etcd_next_steps;
use crate::common::*;
use crate::confirm::{Summary, confirm};
use crate::render::{EtcdEnv, InitialClusterState, etcd_unit, write_file};
use crate::step::Step;
use crate::topology::ClusterTopology;
use crate::workflow::{ClusterState, WorkflowStore};
use cmd_lib::*;
use std::io::{Error, Write};
use std::path::PathBuf;

#[derive(Debug, clap::Args)]
pub struct EtcdArgs {
    #[arg(long, help = "TOML file listing the three cluster nodes (name, ip)")]
    pub topology: Option<PathBuf>,

    #[arg(long, help = "Use this IP instead of the first address from `hostname -I`")]
    pub node_ip: Option<String>,

    #[arg(long, default_value = ETCD_VERSION)]
    pub etcd_version: String,

    #[arg(long, default_value = ETCD_CLUSTER_TOKEN)]
    pub cluster_token: String,

    #[arg(long, value_enum, default_value_t = InitialClusterState::New)]
    pub initial_cluster_state: InitialClusterState,
}

pub fn load_topology(path: Option<&PathBuf>) -> Result<ClusterTopology, Error> {
    match path {
        Some(path) => {
            info!("Loading topology from {}", path.display());
            ClusterTopology::load(path)
        }
        None => Ok(ClusterTopology::default()),
    }
}

pub fn bootstrap(session: &mut Session, args: &EtcdArgs) -> CmdResult {
    info!("Starting etcd bootstrap");

    require_root(session.runner, "etcd")?;
    let arch = detect_arch(session.runner)?;
    let topology = load_topology(args.topology.as_ref())?;

    let my_ip = match &args.node_ip {
        Some(ip) => ip.clone(),
        None => primary_ip(session.runner)?,
    };
    let current = topology.resolve(&my_ip)?;
    info!(
        "Member name: {}, IP: {}, node {} of {}",
        current.name,
        current.ip,
        current.ordinal,
        topology.nodes().len()
    );

    let env = EtcdEnv::new(
        &topology,
        &current,
        args.initial_cluster_state,
        &args.cluster_token,
    );
    info!("Initial cluster: {}", env.initial_cluster);

    let state = WorkflowStore::new(&session.root).state()?;

    let mut summary = Summary::new("etcd configuration")
        .row("Node", format!("{} (node {})", current.name, current.ordinal))
        .row("Node IP", &current.ip)
        .row("Architecture", arch)
        .row("etcd version", &args.etcd_version);
    for (key, value) in env.entries() {
        summary = summary.row(key, value);
    }
    summary = summary
        .row("Config file", ETCD_CONF_FILE)
        .row("Service file", systemd_unit_path("etcd"))
        .row("Recorded cluster state", state);
    if !confirm(&summary, session.input, session.output)? {
        info!("Aborted by operator, nothing was changed");
        return Ok(());
    }

    ensure_system_user(session.runner, ETCD_USER, ETCD_DATA_DIR)?;
    install_etcd(session, &args.etcd_version, arch)?;
    ensure_owned_dir(session, ETCD_DATA_DIR, ETCD_USER, "700")?;

    info!("Writing etcd config to {ETCD_CONF_FILE}");
    write_file(&session.root, ETCD_CONF_FILE, &env.render(), MODE_PUBLIC)?;

    info!("Creating etcd systemd service");
    let unit = etcd_unit(&format!("{ETCD_BIN_DIR}/etcd"));
    write_file(
        &session.root,
        &systemd_unit_path("etcd"),
        &unit.render(),
        MODE_PUBLIC,
    )?;
    enable_service_stopped(session.runner, "etcd")?;

    etcd_next_steps(&topology, &current, state).write_to("Next steps", session.output)?;
    info!("etcd bootstrap complete, service is enabled but not started");
    Ok(())
}

/// Parses the version out of `etcd --version` output.
pub fn installed_version(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("etcd Version:"))
        .map(str::trim)
}

fn install_etcd(session: &mut Session, version: &str, arch: &str) -> CmdResult {
    let bin_dir = session.path(ETCD_BIN_DIR).to_string_lossy().into_owned();
    let etcd_bin = format!("{bin_dir}/etcd");

    if let Ok(output) = session.runner.capture(&Step::query(&etcd_bin, &["--version"]))
        && installed_version(&output) == Some(version.trim_start_matches('v'))
    {
        warn!("etcd {version} is already installed, skipping download");
        return Ok(());
    }

    let tarball = format!("etcd-{version}-linux-{arch}.tar.gz");
    let url = format!("https://github.com/etcd-io/etcd/releases/download/{version}/{tarball}");
    let work_dir = session
        .path("/tmp/pgha-bootstrap-etcd")
        .to_string_lossy()
        .into_owned();
    let tarball_path = format!("{work_dir}/{tarball}");
    let etcd_src = format!("{work_dir}/etcd");
    let etcdctl_src = format!("{work_dir}/etcdctl");

    session.runner.run_all(&[
        Step::new("Preparing download directory", "mkdir").args(&["-p", work_dir.as_str()]),
        Step::new(format!("Downloading etcd {version} for {arch}"), "curl").args(&[
            "-fsSL",
            "-o",
            tarball_path.as_str(),
            url.as_str(),
        ]),
        Step::new("Extracting etcd", "tar").args(&[
            "-xzf",
            tarball_path.as_str(),
            "-C",
            work_dir.as_str(),
            "--strip-components=1",
        ]),
        Step::new(format!("Installing etcd and etcdctl to {bin_dir}"), "install").args(&[
            "-D",
            "-m",
            "0755",
            "-t",
            bin_dir.as_str(),
            etcd_src.as_str(),
            etcdctl_src.as_str(),
        ]),
        Step::new("Removing download directory", "rm")
            .args(&["-rf", work_dir.as_str()])
            .tolerated(),
    ])
}

#[derive(Debug, clap::Subcommand)]
pub enum ClusterCommand {
    #[clap(about = "Show the recorded bootstrap state and every node's next steps")]
    Status {
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    #[clap(about = "Record that the next bootstrap step has been carried out")]
    Advance {
        #[arg(value_enum)]
        to: ClusterState,
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    #[clap(about = "Forget the recorded bootstrap state")]
    Reset,
}

pub fn run_cluster_command(session: &mut Session, command: &ClusterCommand) -> CmdResult {
    let store = WorkflowStore::new(&session.root);
    let (topology, advance_to) = match command {
        ClusterCommand::Status { topology } => (topology.as_ref(), None),
        ClusterCommand::Advance { to, topology } => (topology.as_ref(), Some(*to)),
        ClusterCommand::Reset => return store.reset(),
    };

    let topology = load_topology(topology)?;
    if let Some(to) = advance_to {
        store.advance(to)?;
    }
    let state = store.state()?;
    writeln!(
        session.output,
        "Cluster state: {state} (recorded in {})",
        store.path().display()
    )?;
    for node in topology.nodes() {
        let current = topology.resolve(&node.ip)?;
        let title = format!("node {} ({}, {})", current.ordinal, current.name, current.ip);
        etcd_next_steps(&topology, &current, state).write_to(&title, session.output)?;
    }
    Ok(())
}
