//! Custom error types for the failover agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the protocol does not allow.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A request was well-formed on the wire but semantically invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The peer reported an I/O failure on its side.
    #[error("Remote I/O error: {0}")]
    Remote(String),

    /// The handshake token was missing, expired or not scoped to a target.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Store error: {0}")]
    Store(#[from] failover_store::StoreError),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Process shutdown interrupted the operation. Never retried or swallowed.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl AgentError {
    /// Errors that must stop the caller's loop instead of being recorded and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Shutdown)
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            AgentError::Shutdown
        } else {
            AgentError::Daemon(format!("background task failed: {}", e))
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
