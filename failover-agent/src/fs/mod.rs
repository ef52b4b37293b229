//! Filesystem access for replication.
//!
//! This module provides the ordered source walk, the no-copy list, and the
//! metadata helpers the receiver uses to inspect and correct destination nodes.

pub mod exclusion;
pub mod metadata;
pub mod paths;
pub mod walker;

pub use exclusion::ExclusionRegistry;
pub use walker::{walk_batches, Batches};
