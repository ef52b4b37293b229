//! Batch protocol shared by the sending and receiving sides.
//!
//! A session starts with a handshake (request type, authorization token,
//! compression flag) answered by `PROCEED` or an error. Batches of
//! [`FileEntry`] values follow; the receiver answers each batch with one
//! [`Decision`] byte per present entry, then consumes a content sub-stream for
//! every entry that requested data. A batch header of `-1` ends the run.

pub mod codes;
pub mod entry;
pub mod wire;

pub use codes::{ControlCode, Decision, RequestType};
pub use entry::{BatchHeader, EntryKind, FileEntry, FileKind};
