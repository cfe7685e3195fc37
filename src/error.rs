//! Unified error types for PTM

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for topology operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Dependency errors
    #[error("Unknown dependency '{dependency}' declared by host '{host}'")]
    UnknownDependency { host: String, dependency: String },

    #[error("Cyclic dependency detected involving host '{0}'")]
    CyclicDependency(String),

    #[error("Unknown host implementation '{0}'")]
    UnknownImplementation(String),

    #[error("Unknown application kind '{0}'")]
    UnknownApplication(String),

    // Object lookup errors
    #[error("Host '{0}' not found")]
    HostNotFound(String),

    #[error("Interface '{interface}' not found on host '{host}'")]
    InterfaceNotFound { host: String, interface: String },

    #[error("Bridge '{bridge}' not found on host '{host}'")]
    BridgeNotFound { host: String, bridge: String },

    #[error("Bridge '{0}' has not been created yet")]
    BridgeNotRealized(String),

    #[error("Network namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Link '{0}' not found")]
    LinkNotFound(String),

    // API misuse
    #[error("Host '{host}' cannot {event} from state {state}")]
    InvalidTransition {
        host: String,
        event: String,
        state: String,
    },

    #[error("Invalid argument: {0}")]
    ArgumentMismatch(String),

    // OS command errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {seconds} seconds")]
    CommandTimeout { command: String, seconds: u64 },

    // Application hook errors
    #[error("Application '{app}' failed at '{phase}': {message}")]
    ApplicationFailed {
        app: String,
        phase: String,
        message: String,
    },
}

/// Coarse error taxonomy surfaced to callers and mapped to exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ObjectNotFound,
    ArgumentMismatch,
    SubprocessFailed,
    Timeout,
    Io,
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::ConfigRead { .. }
            | Error::ConfigParse(_)
            | Error::JsonParse(_)
            | Error::ConfigValidation(_)
            | Error::UnknownDependency { .. }
            | Error::CyclicDependency(_)
            | Error::UnknownImplementation(_)
            | Error::UnknownApplication(_) => ErrorKind::Configuration,
            Error::HostNotFound(_)
            | Error::InterfaceNotFound { .. }
            | Error::BridgeNotFound { .. }
            | Error::BridgeNotRealized(_)
            | Error::NamespaceNotFound(_)
            | Error::LinkNotFound(_) => ErrorKind::ObjectNotFound,
            Error::InvalidTransition { .. } | Error::ArgumentMismatch(_) => {
                ErrorKind::ArgumentMismatch
            }
            Error::CommandFailed { .. } | Error::ApplicationFailed { .. } => {
                ErrorKind::SubprocessFailed
            }
            Error::CommandTimeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Process exit code for `ptm-ctl`
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Io => 1,
            ErrorKind::ArgumentMismatch => 2,
            ErrorKind::ObjectNotFound => 3,
            ErrorKind::SubprocessFailed => 4,
            ErrorKind::Configuration => 5,
            ErrorKind::Timeout => 6,
        }
    }
}

/// Result type alias for topology operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            Error::ArgumentMismatch("x".into()),
            Error::HostNotFound("h".into()),
            Error::CommandFailed {
                command: "ip".into(),
                message: "boom".into(),
            },
            Error::CyclicDependency("a".into()),
            Error::CommandTimeout {
                command: "ip".into(),
                seconds: 1,
            },
        ];

        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_bridge_not_realized_is_object_not_found() {
        let err = Error::BridgeNotRealized("br0".into());
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
    }
}
