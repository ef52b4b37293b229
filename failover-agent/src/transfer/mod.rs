//! Byte-stream plumbing between the session logic and the socket.
//!
//! - [`counting`]: wire-level in/out totals
//! - [`throttle`]: sender-side bandwidth shaping
//! - [`compression`]: pluggable codec stages
//! - [`layers`]: the ordered stack that composes them
//! - [`stats`]: run summaries

pub mod compression;
pub mod counting;
pub mod layers;
pub mod stats;
pub mod throttle;

pub use compression::{should_compress, CodecStage, ZstdStage};
pub use counting::TrafficCounters;
pub use layers::{Layer, LayerStack};
