//! Failover Store
//!
//! SQLite-backed inventory and replication log used by the failover agent.
//! The agent only sees the [`Inventory`] and [`ReplicationLog`] traits; the
//! [`SqliteStore`] here is the implementation shipped with the daemon.

pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StoreError};
pub use models::replication_run::ReplicationRun;
pub use models::replication_target::{CreateTargetRequest, ReplicationTarget};
pub use models::server::Server;
pub use models::token::ReceiveGrant;
pub use store::{Inventory, ReplicationLog, SqliteStore};
