use crate::advisor::azure_lb_next_steps;
use crate::common::*;
use crate::confirm::{Summary, ask_yes_no, confirm};
use crate::error::BootstrapError;
use crate::step::Step;
use cmd_lib::*;
use std::io::{Error, Write};
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum LbMode {
    Both,
    WriteOnly,
    ReadOnly,
}

impl LbMode {
    pub fn roles(self) -> &'static [LbRole] {
        match self {
            LbMode::Both => &[LbRole::Write, LbRole::Read],
            LbMode::WriteOnly => &[LbRole::Write],
            LbMode::ReadOnly => &[LbRole::Read],
        }
    }
}

/// Which Patroni role a front-end sends traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LbRole {
    Write,
    Read,
}

impl LbRole {
    /// Patroni REST endpoint that answers 200 only on nodes holding this role.
    pub fn probe_path(self) -> &'static str {
        match self {
            LbRole::Write => "/primary",
            LbRole::Read => "/replica",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, clap::ValueEnum)]
pub enum Distribution {
    #[value(name = "Default")]
    Default,
    #[value(name = "SourceIP")]
    #[strum(serialize = "SourceIP")]
    SourceIp,
    #[value(name = "SourceIPProtocol")]
    #[strum(serialize = "SourceIPProtocol")]
    SourceIpProtocol,
}

#[derive(Debug, clap::Args)]
pub struct AzureLbArgs {
    #[arg(short = 'g', long, help = "Resource group holding the VNet and the database VMs")]
    pub resource_group: String,

    #[arg(long)]
    pub vnet: String,

    #[arg(long)]
    pub subnet: String,

    #[arg(long, value_delimiter = ',', required = true, help = "Comma-separated database VM names")]
    pub vms: Vec<String>,

    #[arg(long, value_enum, default_value_t = LbMode::Both)]
    pub mode: LbMode,

    #[arg(long, help = "Private frontend IP of the write (primary) load balancer")]
    pub write_frontend_ip: Option<String>,

    #[arg(long, help = "Private frontend IP of the read (replica) load balancer")]
    pub read_frontend_ip: Option<String>,

    #[arg(long, default_value_t = PATRONI_REST_PORT)]
    pub probe_port: u16,

    #[arg(long, default_value_t = 5, help = "Seconds between health probes")]
    pub probe_interval: u32,

    #[arg(long, default_value_t = 2, help = "Consecutive probe failures before a node is taken out")]
    pub probe_threshold: u32,

    #[arg(long, default_value_t = POSTGRES_PORT)]
    pub frontend_port: u16,

    #[arg(long, default_value_t = POSTGRES_PORT)]
    pub backend_port: u16,

    #[arg(long, default_value_t = 4, help = "TCP idle timeout in minutes")]
    pub idle_timeout: u32,

    #[arg(long, value_enum, default_value_t = Distribution::Default)]
    pub distribution: Distribution,

    #[arg(long, help = "Network security group to receive the probe and PostgreSQL rules")]
    pub nsg: Option<String>,

    #[arg(long, default_value = "pg", help = "Prefix for every created resource name")]
    pub lb_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendIp {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub name: String,
    pub path: String,
    pub port: u16,
    pub interval: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbRule {
    pub name: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub idle_timeout: u32,
    pub distribution: Distribution,
}

/// One Azure load balancer and everything hanging off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    pub role: LbRole,
    pub resource_group: String,
    pub vnet: String,
    pub subnet: String,
    pub name: String,
    pub frontend_ip: FrontendIp,
    pub backend_pool: String,
    pub probe: HealthProbe,
    pub rule: LbRule,
}

pub fn build_specs(args: &AzureLbArgs) -> Result<Vec<LoadBalancerSpec>, BootstrapError> {
    args.mode
        .roles()
        .iter()
        .map(|&role| -> Result<LoadBalancerSpec, BootstrapError> {
            let address = match role {
                LbRole::Write => args.write_frontend_ip.as_ref(),
                LbRole::Read => args.read_frontend_ip.as_ref(),
            }
            .ok_or_else(|| {
                BootstrapError::InvalidArgument(format!(
                    "--{role}-frontend-ip is required with --mode {}",
                    args.mode
                ))
            })?;
            address.parse::<std::net::IpAddr>().map_err(|_| {
                BootstrapError::InvalidArgument(format!("invalid {role} frontend IP {address:?}"))
            })?;

            let prefix = format!("{}-{role}", args.lb_prefix);
            Ok(LoadBalancerSpec {
                role,
                resource_group: args.resource_group.clone(),
                vnet: args.vnet.clone(),
                subnet: args.subnet.clone(),
                name: format!("{prefix}-lb"),
                frontend_ip: FrontendIp {
                    name: format!("{prefix}-frontend"),
                    address: address.clone(),
                },
                backend_pool: format!("{prefix}-pool"),
                probe: HealthProbe {
                    name: format!("{prefix}-probe"),
                    path: role.probe_path().to_string(),
                    port: args.probe_port,
                    interval: args.probe_interval,
                    threshold: args.probe_threshold,
                },
                rule: LbRule {
                    name: format!("{prefix}-rule"),
                    frontend_port: args.frontend_port,
                    backend_port: args.backend_port,
                    idle_timeout: args.idle_timeout,
                    distribution: args.distribution,
                },
            })
        })
        .collect()
}

fn az(description: impl Into<String>, args: &[&str]) -> Step {
    Step::new(description, "az").args(args)
}

fn check_preconditions(session: &mut Session, args: &AzureLbArgs) -> CmdResult {
    let rg = args.resource_group.as_str();
    let missing = |what: String, hint: &str| -> Error {
        BootstrapError::MissingPrecondition {
            what,
            hint: hint.to_string(),
        }
        .into()
    };

    if !session.runner.probe(&Step::query("az", &["version"])) {
        return Err(missing(
            "Azure CLI".to_string(),
            "install it from https://aka.ms/InstallAzureCLI",
        ));
    }
    if !session.runner.probe(&Step::query("az", &["account", "show"])) {
        return Err(missing("Azure login".to_string(), "run `az login` first"));
    }
    if !session.runner.probe(&Step::query("az", &["group", "show", "-n", rg])) {
        return Err(missing(
            format!("resource group {rg}"),
            "check --resource-group and the active subscription (`az account show`)",
        ));
    }
    if !session
        .runner
        .probe(&Step::query("az", &["network", "vnet", "show", "-g", rg, "-n", &args.vnet]))
    {
        return Err(missing(format!("VNet {}", args.vnet), "check --vnet"));
    }
    if !session.runner.probe(&Step::query(
        "az",
        &[
            "network", "vnet", "subnet", "show", "-g", rg, "--vnet-name", &args.vnet, "-n",
            &args.subnet,
        ],
    )) {
        return Err(missing(
            format!("subnet {} in VNet {}", args.subnet, args.vnet),
            "check --subnet",
        ));
    }
    for vm in &args.vms {
        if !session
            .runner
            .probe(&Step::query("az", &["vm", "show", "-g", rg, "-n", vm]))
        {
            return Err(missing(format!("VM {vm}"), "check --vms"));
        }
    }
    if let Some(nsg) = &args.nsg
        && !session
            .runner
            .probe(&Step::query("az", &["network", "nsg", "show", "-g", rg, "-n", nsg]))
    {
        return Err(missing(format!("network security group {nsg}"), "check --nsg"));
    }
    info!("All Azure preconditions are met");
    Ok(())
}

/// Creates a resource unless `show` finds it. An existing resource is
/// reused or, if the operator asks for it, deleted and created again.
/// `detach` removes whatever still references the resource, since Azure
/// refuses to delete a resource in use.
fn ensure_resource(
    session: &mut Session,
    kind: &str,
    name: &str,
    show: Step,
    delete: Step,
    create: Step,
    detach: impl FnOnce(&mut Session) -> CmdResult,
) -> CmdResult {
    if !session.runner.probe(&show) {
        return session.runner.run(&create);
    }

    warn!("{kind} {name} already exists");
    let recreate = ask_yes_no(
        &format!("{kind} {name} already exists. Delete and recreate it?"),
        session.input,
        session.output,
    )?;
    if recreate {
        detach(&mut *session)?;
        session.runner.run(&delete)?;
        session.runner.run(&create)
    } else {
        info!("Using existing {kind} {name}");
        writeln!(session.output, "Using existing {kind} {name}")?;
        Ok(())
    }
}

fn ensure_load_balancer(session: &mut Session, spec: &LoadBalancerSpec) -> CmdResult {
    let (rg, name) = (spec.resource_group.as_str(), spec.name.as_str());
    ensure_resource(
        session,
        "load balancer",
        name,
        Step::query("az", &["network", "lb", "show", "-g", rg, "-n", name]),
        az(
            format!("Deleting load balancer {name}"),
            &["network", "lb", "delete", "-g", rg, "-n", name],
        ),
        az(
            format!("Creating load balancer {name}"),
            &[
                "network",
                "lb",
                "create",
                "-g",
                rg,
                "-n",
                name,
                "--sku",
                "Standard",
                "--vnet-name",
                &spec.vnet,
                "--subnet",
                &spec.subnet,
                "--frontend-ip-name",
                &spec.frontend_ip.name,
                "--private-ip-address",
                &spec.frontend_ip.address,
                "--backend-pool-name",
                &spec.backend_pool,
            ],
        ),
        |session| detach_backends(session, spec),
    )
}

/// `.../networkInterfaces/<nic>/ipConfigurations/<ip-config>` -> `(nic, ip-config)`
fn nic_ip_config(id: &str) -> Option<(&str, &str)> {
    let mut parts = id.trim().trim_end_matches('/').rsplit('/');
    let ip_config = parts.next().filter(|p| !p.is_empty())?;
    if !parts.next()?.eq_ignore_ascii_case("ipConfigurations") {
        return None;
    }
    let nic = parts.next().filter(|p| !p.is_empty())?;
    if !parts.next()?.eq_ignore_ascii_case("networkInterfaces") {
        return None;
    }
    Some((nic, ip_config))
}

/// Takes every NIC ip-config out of the backend pool so the load balancer can be deleted.
fn detach_backends(session: &mut Session, spec: &LoadBalancerSpec) -> CmdResult {
    let (rg, lb, pool) = (
        spec.resource_group.as_str(),
        spec.name.as_str(),
        spec.backend_pool.as_str(),
    );
    let ids = session.runner.output(&Step::query(
        "az",
        &[
            "network",
            "lb",
            "address-pool",
            "show",
            "-g",
            rg,
            "--lb-name",
            lb,
            "-n",
            pool,
            "--query",
            "backendIpConfigurations[].id",
            "-o",
            "tsv",
        ],
    ))?;
    for id in ids.lines().filter(|l| !l.trim().is_empty()) {
        let (nic, ip_config) = nic_ip_config(id).ok_or_else(|| {
            Error::other(format!("Unexpected backend ip configuration id {id}"))
        })?;
        session.runner.run(&az(
            format!("Removing {nic} from backend pool {pool}"),
            &[
                "network",
                "nic",
                "ip-config",
                "address-pool",
                "remove",
                "-g",
                rg,
                "--nic-name",
                nic,
                "--ip-config-name",
                ip_config,
                "--lb-name",
                lb,
                "--address-pool",
                pool,
            ],
        ))?;
    }
    Ok(())
}

/// Deletes the load balancing rules that use the health probe.
fn detach_probe(session: &mut Session, spec: &LoadBalancerSpec) -> CmdResult {
    let (rg, lb) = (spec.resource_group.as_str(), spec.name.as_str());
    let ids = session.runner.output(&Step::query(
        "az",
        &[
            "network",
            "lb",
            "probe",
            "show",
            "-g",
            rg,
            "--lb-name",
            lb,
            "-n",
            &spec.probe.name,
            "--query",
            "loadBalancingRules[].id",
            "-o",
            "tsv",
        ],
    ))?;
    let rules = ids
        .lines()
        .filter_map(|id| id.trim().rsplit('/').next())
        .filter(|rule| !rule.is_empty());
    for rule in rules {
        session.runner.run(&az(
            format!(
                "Deleting load balancing rule {rule} (uses probe {})",
                spec.probe.name
            ),
            &[
                "network", "lb", "rule", "delete", "-g", rg, "--lb-name", lb, "-n", rule,
            ],
        ))?;
    }
    Ok(())
}

fn ensure_probe(session: &mut Session, spec: &LoadBalancerSpec) -> CmdResult {
    let (rg, lb) = (spec.resource_group.as_str(), spec.name.as_str());
    let probe = &spec.probe;
    let port = probe.port.to_string();
    let interval = probe.interval.to_string();
    let threshold = probe.threshold.to_string();
    ensure_resource(
        session,
        "health probe",
        &probe.name,
        Step::query(
            "az",
            &["network", "lb", "probe", "show", "-g", rg, "--lb-name", lb, "-n", &probe.name],
        ),
        az(
            format!("Deleting health probe {}", probe.name),
            &["network", "lb", "probe", "delete", "-g", rg, "--lb-name", lb, "-n", &probe.name],
        ),
        az(
            format!("Creating health probe {} (HTTP {})", probe.name, probe.path),
            &[
                "network",
                "lb",
                "probe",
                "create",
                "-g",
                rg,
                "--lb-name",
                lb,
                "-n",
                &probe.name,
                "--protocol",
                "Http",
                "--port",
                &port,
                "--path",
                &probe.path,
                "--interval",
                &interval,
                "--probe-threshold",
                &threshold,
            ],
        ),
        |session| detach_probe(session, spec),
    )
}

fn ensure_rule(session: &mut Session, spec: &LoadBalancerSpec) -> CmdResult {
    let (rg, lb) = (spec.resource_group.as_str(), spec.name.as_str());
    let rule = &spec.rule;
    let frontend_port = rule.frontend_port.to_string();
    let backend_port = rule.backend_port.to_string();
    let idle_timeout = rule.idle_timeout.to_string();
    ensure_resource(
        session,
        "load balancing rule",
        &rule.name,
        Step::query(
            "az",
            &["network", "lb", "rule", "show", "-g", rg, "--lb-name", lb, "-n", &rule.name],
        ),
        az(
            format!("Deleting load balancing rule {}", rule.name),
            &["network", "lb", "rule", "delete", "-g", rg, "--lb-name", lb, "-n", &rule.name],
        ),
        az(
            format!("Creating load balancing rule {}", rule.name),
            &[
                "network",
                "lb",
                "rule",
                "create",
                "-g",
                rg,
                "--lb-name",
                lb,
                "-n",
                &rule.name,
                "--protocol",
                "Tcp",
                "--frontend-port",
                &frontend_port,
                "--backend-port",
                &backend_port,
                "--frontend-ip-name",
                &spec.frontend_ip.name,
                "--backend-pool-name",
                &spec.backend_pool,
                "--probe-name",
                &spec.probe.name,
                "--idle-timeout",
                &idle_timeout,
                "--load-distribution",
                rule.distribution.as_ref(),
            ],
        ),
        |_| Ok(()),
    )
}

fn add_backends(session: &mut Session, spec: &LoadBalancerSpec, vms: &[String]) -> CmdResult {
    let rg = spec.resource_group.as_str();
    for vm in vms {
        let nic_id = session.runner.output(&Step::query(
            "az",
            &[
                "vm",
                "show",
                "-g",
                rg,
                "-n",
                vm,
                "--query",
                "networkProfile.networkInterfaces[0].id",
                "-o",
                "tsv",
            ],
        ))?;
        let nic_id = nic_id.trim();
        let nic = nic_id
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::other(format!("VM {vm} has no network interface")))?
            .to_string();
        let ip_config = session.runner.output(&Step::query(
            "az",
            &[
                "network",
                "nic",
                "show",
                "--ids",
                nic_id,
                "--query",
                "ipConfigurations[0].name",
                "-o",
                "tsv",
            ],
        ))?;

        session.runner.run(&az(
            format!("Adding {vm} ({nic}) to backend pool {}", spec.backend_pool),
            &[
                "network",
                "nic",
                "ip-config",
                "address-pool",
                "add",
                "-g",
                rg,
                "--nic-name",
                &nic,
                "--ip-config-name",
                ip_config.trim(),
                "--lb-name",
                &spec.name,
                "--address-pool",
                &spec.backend_pool,
            ],
        ))?;
    }
    Ok(())
}

/// Only warns: members may still be settling when this runs.
fn verify_backend_pool(session: &mut Session, spec: &LoadBalancerSpec, expected: usize) {
    let count = session.runner.output(&Step::query(
        "az",
        &[
            "network",
            "lb",
            "address-pool",
            "show",
            "-g",
            &spec.resource_group,
            "--lb-name",
            &spec.name,
            "-n",
            &spec.backend_pool,
            "--query",
            "length(backendIpConfigurations)",
            "-o",
            "tsv",
        ],
    ));
    match count.map(|c| c.trim().parse::<usize>()) {
        Ok(Ok(n)) if n == expected => {
            info!("Backend pool {} has {n} members", spec.backend_pool)
        }
        Ok(Ok(n)) => warn!(
            "Backend pool {} has {n} members, expected {expected}",
            spec.backend_pool
        ),
        Ok(Err(e)) => warn!("Could not parse member count of {}: {e}", spec.backend_pool),
        Err(e) => warn!("Could not verify backend pool {}: {e}", spec.backend_pool),
    }
}

fn ensure_nsg_rules(session: &mut Session, rg: &str, nsg: &str, args: &AzureLbArgs) -> CmdResult {
    let probe_port = args.probe_port.to_string();
    let backend_port = args.backend_port.to_string();
    for (rule, priority, source, port) in [
        ("AllowHealthProbe", "100", "AzureLoadBalancer", probe_port.as_str()),
        ("AllowPostgreSQL", "110", "VirtualNetwork", backend_port.as_str()),
    ] {
        ensure_resource(
            session,
            "NSG rule",
            rule,
            Step::query(
                "az",
                &["network", "nsg", "rule", "show", "-g", rg, "--nsg-name", nsg, "-n", rule],
            ),
            az(
                format!("Deleting NSG rule {rule}"),
                &["network", "nsg", "rule", "delete", "-g", rg, "--nsg-name", nsg, "-n", rule],
            ),
            az(
                format!("Creating NSG rule {rule} ({source} -> port {port})"),
                &[
                    "network",
                    "nsg",
                    "rule",
                    "create",
                    "-g",
                    rg,
                    "--nsg-name",
                    nsg,
                    "-n",
                    rule,
                    "--priority",
                    priority,
                    "--direction",
                    "Inbound",
                    "--access",
                    "Allow",
                    "--protocol",
                    "Tcp",
                    "--source-address-prefixes",
                    source,
                    "--destination-port-ranges",
                    port,
                ],
            ),
            |_| Ok(()),
        )?;
    }
    Ok(())
}

fn summary(args: &AzureLbArgs, specs: &[LoadBalancerSpec]) -> Summary {
    let mut summary = Summary::new("Azure load balancer configuration")
        .row("Resource group", &args.resource_group)
        .row("VNet / subnet", format!("{} / {}", args.vnet, args.subnet))
        .row("VMs", args.vms.join(", "))
        .row("Mode", args.mode)
        .row("NSG", args.nsg.as_deref().unwrap_or("(not managed)"));
    for spec in specs {
        let role = spec.role;
        summary = summary
            .row(&format!("{role}: load balancer"), &spec.name)
            .row(
                &format!("{role}: frontend"),
                format!("{} ({})", spec.frontend_ip.address, spec.frontend_ip.name),
            )
            .row(&format!("{role}: backend pool"), &spec.backend_pool)
            .row(
                &format!("{role}: probe"),
                format!(
                    "HTTP :{}{} every {}s, threshold {}",
                    spec.probe.port, spec.probe.path, spec.probe.interval, spec.probe.threshold
                ),
            )
            .row(
                &format!("{role}: rule"),
                format!(
                    "TCP {} -> {}, idle {}m, distribution {}",
                    spec.rule.frontend_port,
                    spec.rule.backend_port,
                    spec.rule.idle_timeout,
                    spec.rule.distribution
                ),
            );
    }
    summary
}

pub fn provision(session: &mut Session, args: &AzureLbArgs) -> CmdResult {
    info!("Starting Azure load balancer provisioning (mode: {})", args.mode);

    let specs = build_specs(args)?;
    check_preconditions(session, args)?;

    if !confirm(&summary(args, &specs), session.input, session.output)? {
        info!("Aborted by operator, nothing was changed");
        return Ok(());
    }

    for spec in &specs {
        info!("Provisioning {} load balancer {}", spec.role, spec.name);
        ensure_load_balancer(session, spec)?;
        ensure_probe(session, spec)?;
        ensure_rule(session, spec)?;
        add_backends(session, spec, &args.vms)?;
        verify_backend_pool(session, spec, args.vms.len());
    }

    if let Some(nsg) = &args.nsg {
        ensure_nsg_rules(session, &args.resource_group, nsg, args)?;
    }

    azure_lb_next_steps(&specs).write_to("Next steps", session.output)?;
    info!("Azure load balancer provisioning is done");
    Ok(())
}
