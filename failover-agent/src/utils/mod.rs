//! Utility modules for the failover agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};

/// Run filesystem or store work on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
