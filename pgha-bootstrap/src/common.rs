use crate::error::BootstrapError;
use crate::step::{Runner, Step};
use cmd_lib::*;
use std::io::{BufRead, Error, Write};
use std::path::{Path, PathBuf};
use strum::{AsRefStr, Display};

pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;
pub const ETCD_VERSION: &str = "v3.5.17";
pub const ETCD_CLUSTER_TOKEN: &str = "pg-etcd-cluster";
pub const ETCD_BIN_DIR: &str = "/usr/local/bin";
pub const ETCD_CONF_FILE: &str = "/etc/etcd/etcd.conf";
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";
pub const ETCD_USER: &str = "etcd";

pub const PATRONI_CONF_FILE: &str = "/etc/patroni/patroni.yml";
pub const PATRONI_DATA_DIR: &str = "/var/lib/patroni";
pub const PATRONI_REST_PORT: u16 = 8008;
pub const POSTGRES_PORT: u16 = 5432;
pub const POSTGRES_VERSION: &str = "16";
pub const POSTGRES_USER: &str = "postgres";
pub const DEFAULT_CLUSTER_NAME: &str = "postgres-cluster";

pub const SYSTEMD_DIR: &str = "/etc/systemd/system";
pub const STATE_FILE: &str = "/var/lib/pgha-bootstrap/etcd-cluster.toml";

pub const MODE_SECRET: u32 = 0o600;
pub const MODE_PUBLIC: u32 = 0o644;

/// Everything a provisioning run touches outside of its own options.
pub struct Session<'a> {
    /// Prefix for every file path, `/` on a real host.
    pub root: PathBuf,
    pub runner: &'a mut dyn Runner,
    pub input: &'a mut dyn BufRead,
    pub output: &'a mut dyn Write,
}

impl Session<'_> {
    pub fn path(&self, path: &str) -> PathBuf {
        resolve(&self.root, path)
    }
}

pub fn resolve(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

pub fn require_root(runner: &mut dyn Runner, command: &str) -> CmdResult {
    let uid = runner.output(&Step::query("id", &["-u"]))?;
    if uid.trim() != "0" {
        return Err(BootstrapError::NotRoot {
            command: format!("pgha-bootstrap {command}"),
        }
        .into());
    }
    Ok(())
}

/// Maps `uname -m` to the architecture suffix used by etcd release tarballs.
pub fn detect_arch(runner: &mut dyn Runner) -> Result<&'static str, Error> {
    let machine = runner.output(&Step::query("uname", &["-m"]))?;
    match machine.trim() {
        "x86_64" | "amd64" => Ok("amd64"),
        "aarch64" | "arm64" => Ok("arm64"),
        other => Err(BootstrapError::UnsupportedArch(other.to_string()).into()),
    }
}

pub fn primary_ip(runner: &mut dyn Runner) -> FunResult {
    let addrs = runner.output(&Step::query("hostname", &["-I"]))?;
    addrs
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::other("`hostname -I` returned no addresses"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub codename: Option<String>,
    pub package_manager: PackageManager,
}

pub fn detect_os(root: &Path) -> Result<OsRelease, Error> {
    let path = resolve(root, "/etc/os-release");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::other(format!("Failed to read {}: {e}", path.display())))?;
    parse_os_release(&content)
}

pub fn parse_os_release(content: &str) -> Result<OsRelease, Error> {
    let field = |key: &str| {
        content.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_string())
        })
    };

    let id = field("ID").unwrap_or_default();
    let package_manager = match id.as_str() {
        "ubuntu" | "debian" => PackageManager::Apt,
        "rhel" | "rocky" | "almalinux" | "centos" | "fedora" => PackageManager::Dnf,
        _ => {
            let id_like = field("ID_LIKE").unwrap_or_default();
            if id_like.split_whitespace().any(|l| l == "debian") {
                PackageManager::Apt
            } else if id_like
                .split_whitespace()
                .any(|l| l == "rhel" || l == "fedora")
            {
                PackageManager::Dnf
            } else {
                let name = if id.is_empty() { "unknown" } else { id.as_str() };
                return Err(BootstrapError::UnsupportedOs(name.to_string()).into());
            }
        }
    };

    Ok(OsRelease {
        version_id: field("VERSION_ID").unwrap_or_default(),
        codename: field("VERSION_CODENAME").filter(|c| !c.is_empty()),
        id,
        package_manager,
    })
}

/// Creates a system account unless it already exists.
pub fn ensure_system_user(runner: &mut dyn Runner, user: &str, home: &str) -> CmdResult {
    if runner.probe(&Step::query("id", &["-u", user])) {
        warn!("User {user} already exists, skipping creation");
        return Ok(());
    }
    runner.run(
        &Step::new(format!("Creating system user {user}"), "useradd").args(&[
            "--system",
            "--home-dir",
            home,
            "--shell",
            "/sbin/nologin",
            user,
        ]),
    )
}

/// Creates a directory owned by `owner` with the given mode.
pub fn ensure_owned_dir(session: &mut Session, dir: &str, owner: &str, mode: &str) -> CmdResult {
    let path = session.path(dir);
    std::fs::create_dir_all(&path)
        .map_err(|e| Error::other(format!("Failed to create {}: {e}", path.display())))?;
    let path = path.to_string_lossy().into_owned();
    let owner = format!("{owner}:{owner}");
    session.runner.run_all(&[
        Step::new(format!("Setting owner of {path} to {owner}"), "chown").args(&[
            "-R",
            owner.as_str(),
            path.as_str(),
        ]),
        Step::new(format!("Setting mode of {path} to {mode}"), "chmod").args(&[mode, path.as_str()]),
    ])
}

pub fn systemd_unit_path(service: &str) -> String {
    format!("{SYSTEMD_DIR}/{service}.service")
}

/// Installs a unit without starting it: stop (if running), reload, enable.
pub fn enable_service_stopped(runner: &mut dyn Runner, service: &str) -> CmdResult {
    runner.run_all(&[
        Step::new(format!("Stopping {service} if running"), "systemctl")
            .args(&["stop", service])
            .tolerated(),
        Step::new("Reloading systemd units", "systemctl").arg("daemon-reload"),
        Step::new(format!("Enabling {service} (not started)"), "systemctl")
            .args(&["enable", service]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::testing::RecordingRunner;

    #[test]
    fn test_parse_os_release_ubuntu() {
        let content = r#"PRETTY_NAME="Ubuntu 22.04.4 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION_CODENAME=jammy
ID=ubuntu
ID_LIKE=debian
"#;
        let os = parse_os_release(content).unwrap();
        assert_eq!(os.id, "ubuntu");
        assert_eq!(os.version_id, "22.04");
        assert_eq!(os.codename.as_deref(), Some("jammy"));
        assert_eq!(os.package_manager, PackageManager::Apt);
    }

    #[test]
    fn test_parse_os_release_id_like_rhel() {
        let content = "ID=\"ol\"\nID_LIKE=\"fedora rhel\"\nVERSION_ID=\"9.3\"\n";
        let os = parse_os_release(content).unwrap();
        assert_eq!(os.package_manager, PackageManager::Dnf);
        assert_eq!(os.codename, None);
    }

    #[test]
    fn test_parse_os_release_unsupported() {
        let err = parse_os_release("ID=alpine\nVERSION_ID=3.19\n").unwrap_err();
        assert!(err.to_string().contains("alpine"));
    }

    #[test]
    fn test_detect_arch() {
        let mut runner = RecordingRunner::new().respond("uname -m", "aarch64\n");
        assert_eq!(detect_arch(&mut runner).unwrap(), "arm64");

        let mut runner = RecordingRunner::new().respond("uname -m", "riscv64");
        assert!(detect_arch(&mut runner).is_err());
    }

    #[test]
    fn test_require_root() {
        let mut runner = RecordingRunner::new().respond("id -u", "1000");
        let err = require_root(&mut runner, "etcd").unwrap_err();
        assert!(err.to_string().contains("sudo pgha-bootstrap etcd"));
    }

    #[test]
    fn test_primary_ip_takes_first_address() {
        let mut runner = RecordingRunner::host("10.0.0.12");
        assert_eq!(primary_ip(&mut runner).unwrap(), "10.0.0.12");
    }

    #[test]
    fn test_existing_user_is_not_recreated() {
        let mut runner = RecordingRunner::new();
        ensure_system_user(&mut runner, "etcd", "/var/lib/etcd").unwrap();
        assert!(!runner.called("useradd"));

        let mut runner = RecordingRunner::new().fail("id -u etcd");
        ensure_system_user(&mut runner, "etcd", "/var/lib/etcd").unwrap();
        assert!(runner.called("useradd --system --home-dir /var/lib/etcd"));
    }
}
