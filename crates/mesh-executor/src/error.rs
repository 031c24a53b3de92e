//! Error types for the executor.

use mesh_proto::ContainerId;

/// Result type alias using [`ExecutorError`].
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors that can occur while running containers.
///
/// Every variant resolves to a reply field at the dispatch boundary; nothing
/// is thrown past it.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A per-id command referenced an unknown container.
    #[error("container {0} does not exist")]
    ContainerNotFound(ContainerId),

    /// The container was destroyed while an operation was in flight.
    #[error("container {0} is destroyed")]
    Destroyed(ContainerId),

    /// A mandatory field was missing or empty.
    #[error("missing mandatory field {0:?}")]
    MissingField(&'static str),

    /// The artifact endpoint answered with a non-200 status.
    #[error("artifact download failed: status code {status}")]
    DownloadStatus {
        /// HTTP status the artifact endpoint returned.
        status: u16,
    },

    /// HTTP client failure during download.
    #[error("artifact download failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Archive extraction failure.
    #[error("artifact extraction failed: {0}")]
    Archive(#[source] std::io::Error),

    /// Process spawn failure.
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    /// Signal delivery failure (other than the process being gone).
    #[error("signal delivery failed: {0}")]
    Signal(#[source] std::io::Error),

    /// Control channel failure.
    #[error("control channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid control URL.
    #[error(transparent)]
    ControlUrl(#[from] mesh_proto::ControlUrlError),
}

impl ExecutorError {
    /// Create a channel error.
    #[must_use]
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Validates a mandatory string field, rejecting empty values.
pub fn mandatory(name: &'static str, value: &str) -> ExecutorResult<()> {
    if value.is_empty() {
        return Err(ExecutorError::MissingField(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_matches_wire_contract() {
        let err = ExecutorError::ContainerNotFound(ContainerId::new("9"));
        assert_eq!(err.to_string(), "container 9 does not exist");
    }

    #[test]
    fn mandatory_rejects_empty() {
        assert!(mandatory("token", "T").is_ok());
        let err = mandatory("token", "").unwrap_err();
        assert!(matches!(err, ExecutorError::MissingField("token")));
    }
}
