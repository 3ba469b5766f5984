use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("Disk conversion failed: {0}")]
    Conversion(String),

    #[error("Destination VM {0} already exists")]
    Conflict(u32),

    #[error("Destination API error: {0}")]
    Api(String),

    #[error("Partial failure after {phase}: {source}")]
    PartialFailure {
        phase: Phase,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Migration failed after {phase}: {source}")]
    Failed {
        phase: Phase,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid migration state: {0}")]
    State(String),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(String),
}

/// Coarse classification reported to the operator alongside the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    Conversion,
    Conflict,
    Api,
    PartialFailure,
    Config,
    State,
    Command,
    Io,
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Connection(_) => ErrorKind::Connection,
            MigrationError::Authentication(_) => ErrorKind::Authentication,
            MigrationError::Timeout { .. } => ErrorKind::Timeout,
            MigrationError::Conversion(_) => ErrorKind::Conversion,
            MigrationError::Conflict(_) => ErrorKind::Conflict,
            MigrationError::Api(_) => ErrorKind::Api,
            MigrationError::PartialFailure { .. } => ErrorKind::PartialFailure,
            MigrationError::Failed { source, .. } => source.kind(),
            MigrationError::Config(_) | MigrationError::Serde(_) => ErrorKind::Config,
            MigrationError::State(_) => ErrorKind::State,
            MigrationError::Command { .. } => ErrorKind::Command,
            MigrationError::Io(_) => ErrorKind::Io,
        }
    }

    /// Connection failures are the only class collaborators retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrationError::Connection(_))
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        MigrationError::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Conversion => "ConversionError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Api => "APIError",
            ErrorKind::PartialFailure => "PartialFailureError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::State => "StateError",
            ErrorKind::Command => "CommandError",
            ErrorKind::Io => "IOError",
        };
        f.write_str(name)
    }
}

impl From<toml::de::Error> for MigrationError {
    fn from(err: toml::de::Error) -> Self {
        MigrationError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Serde(err.to_string())
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            MigrationError::Connection(err.to_string())
        } else if err.status().map(|s| s.as_u16()) == Some(401) {
            MigrationError::Authentication(err.to_string())
        } else {
            MigrationError::Api(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_reports_the_underlying_kind() {
        let err = MigrationError::Failed {
            phase: Phase::SourceStopped,
            source: Box::new(MigrationError::Timeout {
                operation: "export".to_string(),
                limit: Duration::from_secs(5),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("SourceStopped"));
    }

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(MigrationError::Connection("refused".into()).is_transient());
        assert!(!MigrationError::Api("bad storage".into()).is_transient());
        assert!(!MigrationError::Conflict(100).is_transient());
    }
}
