//! Error types for the netsweep-discover crate.
//!
//! [`DiscoverError`] is fatal to a run (setup and final persistence).
//! [`ProbeError`] is scoped to a single scan unit and never aborts a sweep.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Core(#[from] netsweep_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;

/// A failure confined to one probe invocation.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe tool not found at path: {path}")]
    ToolNotFound { path: String },

    #[error("Probe tool exited with code {code}: {stderr}")]
    ToolFailed { code: i32, stderr: String },

    #[error("Failed to parse probe output: {0}")]
    Parse(String),

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Unsupported target {target} for {prober} probe")]
    Unsupported { prober: &'static str, target: String },

    #[error("Probe panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Map an IO error from opening a raw channel or spawning a tool.
    pub fn from_spawn(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ToolNotFound {
                path: path.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => {
                Self::InsufficientPrivilege(format!("{path}: {err}"))
            }
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_are_classified() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            ProbeError::from_spawn("nmap", not_found),
            ProbeError::ToolNotFound { path } if path == "nmap"
        ));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            ProbeError::from_spawn("eth0", denied),
            ProbeError::InsufficientPrivilege(_)
        ));

        let other = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(matches!(ProbeError::from_spawn("nmap", other), ProbeError::Io(_)));
    }
}
