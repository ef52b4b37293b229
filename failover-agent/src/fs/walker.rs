//! Ordered source traversal producing protocol batches.
//!
//! The walk is pre-order depth-first with children sorted by name, so every
//! directory's descendants form one contiguous run right after it. The
//! receiver's reconciliation depends on that order.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use walkdir::{DirEntry, FilterEntry, IntoIter, WalkDir};

use super::exclusion::ExclusionRegistry;
use super::metadata::entry_from_metadata;
use super::paths::wire_path;
use crate::protocol::FileEntry;
use crate::utils::errors::{AgentError, Result};

type Prune = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Lazy, finite sequence of entry batches. Exhaustion ends the run.
pub struct Batches {
    root: PathBuf,
    inner: FilterEntry<IntoIter, Prune>,
    batch_size: usize,
    finished: bool,
}

/// Start walking `root`, pruning excluded prefixes.
///
/// A missing or unreadable root fails here rather than yielding an empty tree.
pub fn walk_batches(root: &Path, exclusions: Arc<ExclusionRegistry>, batch_size: usize) -> Result<Batches> {
    std::fs::symlink_metadata(root)?;
    if batch_size == 0 {
        return Err(AgentError::Config("batch size must be at least 1".into()));
    }

    let prune_root = root.to_path_buf();
    let prune: Prune = Box::new(move |entry: &DirEntry| match wire_path(&prune_root, entry.path()) {
        Some(wire) => !exclusions.is_excluded(&wire),
        None => false,
    });

    let inner = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(prune);

    Ok(Batches {
        root: root.to_path_buf(),
        inner,
        batch_size,
        finished: false,
    })
}

impl Batches {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn describe(&self, entry: &DirEntry) -> Result<Option<FileEntry>> {
        if entry.file_type().is_socket() {
            return Ok(None);
        }
        let Some(wire) = wire_path(&self.root, entry.path()) else {
            return Ok(None);
        };
        let described = entry
            .metadata()
            .map_err(walk_error_to_io)
            .and_then(|meta| entry_from_metadata(wire, entry.path(), &meta));
        match described {
            Ok(found) => Ok(found),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %entry.path().display(), "Entry vanished during walk");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn walk_error_to_io(e: walkdir::Error) -> io::Error {
    match e.into_io_error() {
        Some(io_err) => io_err,
        None => io::Error::other("filesystem loop detected"),
    }
}

impl Iterator for Batches {
    type Item = Result<Vec<FileEntry>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(item) = self.inner.next() else {
                self.finished = true;
                break;
            };
            let entry = match item {
                Ok(entry) => entry,
                Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                    debug!(error = %e, "Directory vanished during walk");
                    continue;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(AgentError::Walk(e)));
                }
            };
            match self.describe(&entry) {
                Ok(Some(file_entry)) => batch.push(file_entry),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}
