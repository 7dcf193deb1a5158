use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    TOML(#[from] toml::de::Error),
    #[error("Configuration file not found at path: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO: {0}")]
    IO(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] vm_types::Error),
    #[error("QMP Error: {0}")]
    QMP(#[from] qmp::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    /// Deliberately the same for missing and forbidden paths.
    #[error("{}: does not exist or is not trusted", .0.display())]
    Untrusted(PathBuf),
    #[error("Resource unavailable: {0}")]
    Resource(String),
    #[error("Process error: {0}")]
    Process(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("VM {0} not found")]
    VMNotFound(String),
    #[error("VM {0} is not running")]
    VMNotRunning(u32),
    #[error("VM {0}: {1}")]
    InvalidState(u32, String),
    #[error("USB: {0}")]
    Usb(String),
}

impl From<rtnetlink::Error> for Error {
    fn from(err: rtnetlink::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Process(err.to_string())
    }
}
