use std::io::Error;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("this command must be run as root (try: sudo {command})")]
    NotRoot { command: String },

    #[error("unsupported architecture: {0} (supported: x86_64, aarch64)")]
    UnsupportedArch(String),

    #[error("unsupported operating system: {0} (supported: ubuntu, debian, rhel, rocky, almalinux, centos, fedora)")]
    UnsupportedOs(String),

    #[error("local IP {ip} does not match any configured node ({known}); fix the topology or pass --node-ip")]
    NodeNotFound { ip: String, known: String },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("{what} not found: {hint}")]
    MissingPrecondition { what: String, hint: String },

    #[error("cannot move cluster state from {from} to {to}: expected {expected}")]
    InvalidTransition {
        from: String,
        to: String,
        expected: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<BootstrapError> for Error {
    fn from(e: BootstrapError) -> Self {
        Error::other(e)
    }
}
