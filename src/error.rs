//! Error types for lattice-agent.

use thiserror::Error;

/// Errors that can occur in the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// IO error (sockets, credential files, unix socket setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS wire-format error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// Upstream transport error (dial, TLS)
    #[error("upstream transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Upstream stream error
    #[error("upstream stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// Credential file watcher error
    #[error("file watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
