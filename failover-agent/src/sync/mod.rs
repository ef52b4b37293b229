//! Replication session logic.
//!
//! The sender walks the source tree and streams batches; the receiver applies
//! each entry through the [`decision::DecisionEngine`], keeps directory frames
//! in the [`reconciler::DirectoryReconciler`] and writes file bodies through
//! [`content`].

pub mod content;
pub mod decision;
pub mod receiver;
pub mod reconciler;
pub mod sender;

pub use receiver::{receive_tree, ReceiveOptions, ReceiveStats};
pub use sender::{send_tree, SendStats};
