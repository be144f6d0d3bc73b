//! Error types for Metron operations

/// Result type for Metron operations
pub type Result<T> = std::result::Result<T, MetronError>;

/// Error types for the Metron tracing client
///
/// On the steady-state tracing path these are logged and tolerated rather
/// than returned; they only surface from construction and configuration
/// APIs. The profiler must never disrupt the host application.
#[derive(Debug, thiserror::Error)]
pub enum MetronError {
    /// Invalid configuration value (sample rate, socket path, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation called in a state where it is a no-op by contract
    #[error("Usage error: {0}")]
    Usage(String),

    /// Transport handoff to the collector failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for MetronError {
    fn from(s: String) -> Self {
        MetronError::Other(s)
    }
}

impl From<&str> for MetronError {
    fn from(s: &str) -> Self {
        MetronError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for MetronError {
    fn from(err: anyhow::Error) -> Self {
        MetronError::Other(err.to_string())
    }
}
