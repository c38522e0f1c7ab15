mod advisor;
mod azure_lb;
mod common;
mod confirm;
mod error;
mod etcd_server;
mod password;
mod patroni_config;
mod patroni_server;
mod render;
mod step;
mod topology;
mod workflow;

use clap::{Parser, Subcommand};
use cmd_lib::*;
use common::Session;
use std::io::Write;
use std::path::PathBuf;
use step::SystemRunner;

#[derive(Parser)]
#[clap(
    name = "pgha-bootstrap",
    about = "Provision etcd, Patroni and Azure load balancers for a three node PostgreSQL HA cluster",
    version
)]
struct Opts {
    #[arg(long, default_value = "/", hide = true, global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Install and configure an etcd member (enabled, not started)")]
    Etcd(etcd_server::EtcdArgs),

    #[clap(about = "Install PostgreSQL and Patroni and write patroni.yml (enabled, not started)")]
    Patroni(patroni_server::PatroniArgs),

    #[clap(about = "Create or reuse Azure load balancers in front of the Patroni nodes")]
    AzureLb(azure_lb::AzureLbArgs),

    #[clap(subcommand, about = "Track the order in which etcd members join")]
    Cluster(etcd_server::ClusterCommand),
}

#[cmd_lib::main]
fn main() -> CmdResult {
    env_logger::Builder::new()
        .format(|buf, record| {
            let timestamp = chrono::Local::now().format("%b %d %H:%M:%S").to_string();
            let process_name = std::env::current_exe()
                .ok()
                .and_then(|path| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                })
                .unwrap_or_else(|| "pgha-bootstrap".to_string());
            writeln!(
                buf,
                "{} {}[{}]: {} {}",
                timestamp,
                process_name,
                std::process::id(),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let opts = Opts::parse();

    let mut runner = SystemRunner;
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    let mut session = Session {
        root: opts.root,
        runner: &mut runner,
        input: &mut input,
        output: &mut output,
    };

    let command_name = match &opts.command {
        Command::Etcd(args) => {
            etcd_server::bootstrap(&mut session, args)?;
            "etcd"
        }
        Command::Patroni(args) => {
            patroni_server::bootstrap(&mut session, args)?;
            "patroni"
        }
        Command::AzureLb(args) => {
            azure_lb::provision(&mut session, args)?;
            "azure-lb"
        }
        Command::Cluster(command) => {
            etcd_server::run_cluster_command(&mut session, command)?;
            "cluster"
        }
    };

    session.output.flush()?;
    info!("pgha-bootstrap {command_name} is done");
    Ok(())
}
