//! Connections between agents.
//!
//! Sources reach destinations through the bounded [`pool::ConnectionPool`];
//! destinations accept sessions in [`listener`]. Both sides open a session
//! with the [`handshake`] before any batch is exchanged.

pub mod handshake;
pub mod listener;
pub mod pool;

pub use handshake::{client_handshake, server_handshake, SessionGrant};
pub use listener::{serve, ReceiverContext};
pub use pool::{ConnectionPool, PooledConnection};
