//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// Job outcomes (failed, cancelled, timed out) are never represented here;
/// they are data on [`crate::JobStatus`] and [`crate::JobResult`].
#[derive(Debug, Error)]
pub enum Error {
    /// Detected before any remote call; never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The remote session itself failed (unreachable host, failed write).
    #[error("SSH error: {0}")]
    SshError(String),

    /// A remote introspection command ran but did not succeed.
    #[error("Remote execution error: {0}")]
    RemoteExecutionError(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from the transport rather than from bad input
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::SshError(_) | Self::RemoteExecutionError(_))
    }
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::SshError("refused".into()).is_transport());
        assert!(Error::RemoteExecutionError("squeue: error".into()).is_transport());
        assert!(!Error::ConfigError("bad".into()).is_transport());
        assert!(!Error::ValidationError("bad".into()).is_transport());
    }

    #[test]
    fn test_display_includes_class() {
        let err = Error::ConfigError("missing run_dir".into());
        assert_eq!(err.to_string(), "Configuration error: missing run_dir");
    }
}
