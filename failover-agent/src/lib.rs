//! Failover Agent Library
//!
//! Incremental one-way replication of a server's filesystem onto its
//! failover standby: an ordered tree walk, a batched binary protocol, a
//! per-entry decision engine on the receiver and a scheduler that decides
//! when each replication target runs.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod protocol;
pub mod scheduler;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{AgentError, Result};
