//! Deferred directory reconciliation.
//!
//! Every directory entry opens a frame that records which children the sender
//! mentioned. Because the walk is pre-order and sorted, a frame can be closed
//! as soon as an entry outside its subtree arrives. Closing a frame deletes
//! the unmentioned children and applies the directory's own mtime.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::fs::exclusion::ExclusionRegistry;
use crate::fs::metadata::{remove_path, set_mtime};
use crate::utils::errors::{AgentError, Result};

#[derive(Debug)]
struct DirectoryFrame {
    wire: PathBuf,
    local: PathBuf,
    mtime: i64,
    seen: HashSet<OsString>,
    last_child: Option<OsString>,
}

pub struct DirectoryReconciler {
    exclusions: Arc<ExclusionRegistry>,
    stack: Vec<DirectoryFrame>,
    /// Closed frames awaiting finalization, children before parents.
    pending: Vec<DirectoryFrame>,
    rooted: bool,
}

impl DirectoryReconciler {
    /// Children whose wire path is excluded are never deleted.
    pub fn new(exclusions: Arc<ExclusionRegistry>) -> Self {
        Self {
            exclusions,
            stack: Vec::new(),
            pending: Vec::new(),
            rooted: false,
        }
    }

    /// Account for an incoming entry before it is applied.
    ///
    /// Closes every open frame the entry lies outside of and records the
    /// entry as a child of the innermost remaining frame. The first entry of
    /// a run must be the tree root, and it is the only one allowed without
    /// an enclosing frame.
    pub fn enter(&mut self, wire: &Path) -> Result<()> {
        while let Some(top) = self.stack.last() {
            if wire.starts_with(&top.wire) && wire != top.wire {
                break;
            }
            if let Some(frame) = self.stack.pop() {
                self.pending.push(frame);
            }
        }

        let Some(top) = self.stack.last_mut() else {
            if !self.rooted && wire == Path::new("/") {
                self.rooted = true;
                return Ok(());
            }
            return Err(AgentError::Validation(format!(
                "entry {} has no enclosing directory in this run",
                wire.display()
            )));
        };
        match (wire.parent(), wire.file_name()) {
            (Some(parent), Some(name))
                if parent == top.wire && top.last_child.as_deref().map_or(true, |last| last < name) =>
            {
                top.seen.insert(name.to_os_string());
                top.last_child = Some(name.to_os_string());
                Ok(())
            }
            _ => Err(AgentError::Validation(format!(
                "entry {} arrived out of order inside {}",
                wire.display(),
                top.wire.display()
            ))),
        }
    }

    /// Open a frame for a directory that was just applied.
    pub fn push(&mut self, wire: &Path, local: PathBuf, mtime: i64) {
        self.stack.push(DirectoryFrame {
            wire: wire.to_path_buf(),
            local,
            mtime,
            seen: HashSet::new(),
            last_child: None,
        });
    }

    #[cfg(test)]
    fn open_frames(&self) -> usize {
        self.stack.len()
    }

    /// Finalize frames closed so far. Returns the number of removed children.
    ///
    /// Call only after the content of the current batch has been written.
    pub fn finalize_pending(&mut self) -> Result<u64> {
        let mut removed = 0;
        for frame in std::mem::take(&mut self.pending) {
            removed += self.finalize(frame)?;
        }
        Ok(removed)
    }

    /// Close and finalize every remaining frame, innermost first.
    pub fn finish(&mut self) -> Result<u64> {
        while let Some(frame) = self.stack.pop() {
            self.pending.push(frame);
        }
        self.finalize_pending()
    }

    fn finalize(&self, frame: DirectoryFrame) -> Result<u64> {
        let children = match fs::read_dir(&frame.local) {
            Ok(children) => children,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %frame.local.display(), "Directory vanished before finalization");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for child in children {
            let child = child?;
            let name = child.file_name();
            if frame.seen.contains(&name) || self.exclusions.is_excluded(&frame.wire.join(&name)) {
                continue;
            }
            match remove_path(&child.path()) {
                Ok(()) => {
                    debug!(path = %child.path().display(), "Removed entry absent on source");
                    removed += 1;
                }
                Err(e) => warn!(path = %child.path().display(), error = %e, "Failed to remove stale entry"),
            }
        }

        if let Err(e) = set_mtime(&frame.local, frame.mtime) {
            warn!(path = %frame.local.display(), error = %e, "Failed to set directory mtime");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::mtime_millis;
    use tempfile::TempDir;

    fn open(reconciler: &mut DirectoryReconciler, root: &Path, wire: &str, mtime: i64) -> Result<()> {
        let wire = Path::new(wire);
        reconciler.enter(wire)?;
        let local = crate::fs::paths::local_path(root, wire);
        fs::create_dir_all(&local)?;
        reconciler.push(wire, local, mtime);
        Ok(())
    }

    #[test]
    fn test_unobserved_children_deleted_on_finish() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("keep"), b"")?;
        fs::write(root.join("stale"), b"")?;
        fs::create_dir_all(root.join("old/tree"))?;

        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        open(&mut reconciler, root, "/", 10_000)?;
        reconciler.enter(Path::new("/keep"))?;

        assert_eq!(reconciler.finish()?, 2);
        assert!(root.join("keep").exists());
        assert!(!root.join("stale").exists());
        assert!(!root.join("old").exists());
        assert_eq!(mtime_millis(&fs::metadata(root)?), 10_000);
        Ok(())
    }

    #[test]
    fn test_frames_close_when_leaving_subtree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));

        open(&mut reconciler, root, "/", 0)?;
        open(&mut reconciler, root, "/a", 0)?;
        open(&mut reconciler, root, "/a/b", 0)?;
        assert_eq!(reconciler.open_frames(), 3);

        // "/ab" shares a string prefix with "/a" but is not inside it.
        reconciler.enter(Path::new("/ab"))?;
        assert_eq!(reconciler.open_frames(), 1);
        assert_eq!(reconciler.pending.len(), 2);
        assert_eq!(reconciler.pending[0].wire, PathBuf::from("/a/b"));
        Ok(())
    }

    #[test]
    fn test_pending_frames_wait_for_finalize_call() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir(root.join("a"))?;
        fs::write(root.join("a/leftover"), b"")?;

        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        open(&mut reconciler, root, "/", 0)?;
        open(&mut reconciler, root, "/a", 0)?;
        reconciler.enter(Path::new("/b"))?;

        assert!(root.join("a/leftover").exists());
        assert_eq!(reconciler.finalize_pending()?, 1);
        assert!(!root.join("a/leftover").exists());
        Ok(())
    }

    #[test]
    fn test_out_of_order_entry_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        open(&mut reconciler, root, "/", 0)?;
        open(&mut reconciler, root, "/a", 0)?;
        reconciler.enter(Path::new("/b"))?;

        let late = reconciler.enter(Path::new("/a/c"));
        assert!(matches!(late, Err(AgentError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_unsorted_or_repeated_siblings_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        open(&mut reconciler, root, "/", 0)?;
        reconciler.enter(Path::new("/b"))?;

        assert!(matches!(reconciler.enter(Path::new("/a")), Err(AgentError::Validation(_))));
        assert!(matches!(reconciler.enter(Path::new("/b")), Err(AgentError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_run_must_start_at_root() -> Result<()> {
        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        let first = reconciler.enter(Path::new("/etc/passwd"));
        assert!(matches!(first, Err(AgentError::Validation(_))));

        let temp_dir = TempDir::new()?;
        let mut reconciler = DirectoryReconciler::new(Arc::new(ExclusionRegistry::empty()));
        open(&mut reconciler, temp_dir.path(), "/", 0)?;
        let repeated = reconciler.enter(Path::new("/"));
        assert!(matches!(repeated, Err(AgentError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_excluded_children_survive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir(root.join("proc"))?;
        fs::write(root.join("proc/cpuinfo"), b"")?;

        let exclusions = ExclusionRegistry::empty().with_prefixes(["/proc"]);
        let mut reconciler = DirectoryReconciler::new(Arc::new(exclusions));
        open(&mut reconciler, root, "/", 0)?;

        assert_eq!(reconciler.finish()?, 0);
        assert!(root.join("proc/cpuinfo").exists());
        Ok(())
    }
}
