//! Per-entry decisions on the receiving side.
//!
//! [`DecisionEngine::apply`] makes the destination node match the entry's
//! type (creating or replacing it), corrects ownership, permissions and
//! modification time, and reports what the sender has to do next.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{lchown, symlink};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use crate::fs::metadata::{remove_path, set_mtime, set_permissions, DiskState};
use crate::fs::paths::local_path;
use crate::protocol::{Decision, EntryKind, FileEntry, FileKind};
use crate::utils::errors::Result;

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    root: PathBuf,
    verify_content: bool,
}

impl DecisionEngine {
    /// With `verify_content`, regular files whose size and mtime already
    /// match are resent anyway.
    pub fn new(root: impl Into<PathBuf>, verify_content: bool) -> Self {
        Self {
            root: root.into(),
            verify_content,
        }
    }

    pub fn local_path(&self, wire: &Path) -> PathBuf {
        local_path(&self.root, wire)
    }

    pub fn apply(&self, entry: &FileEntry) -> Result<Decision> {
        let local = self.local_path(&entry.path);
        let mut existing = DiskState::probe(&local)?;

        if let Some(state) = &existing {
            if state.kind() != Some(entry.kind.file_kind()) {
                debug!(path = %local.display(), "Replacing node of a different type");
                remove_path(&local)?;
                existing = None;
            }
        }

        let mut awaiting_content = false;
        let decision = match &entry.kind {
            EntryKind::BlockDevice { device, .. } | EntryKind::CharDevice { device, .. } => match &existing {
                Some(state) if state.device() == *device => Decision::NoChange,
                Some(_) => {
                    remove_path(&local)?;
                    make_device(&local, entry.kind.file_kind(), entry.permissions, *device)?;
                    Decision::Modified
                }
                None => {
                    make_device(&local, entry.kind.file_kind(), entry.permissions, *device)?;
                    Decision::Modified
                }
            },
            EntryKind::Directory { mtime } => match &existing {
                None => {
                    if entry.path == Path::new("/") {
                        fs::create_dir_all(&local)?;
                    } else {
                        fs::create_dir(&local)?;
                    }
                    Decision::Modified
                }
                // The mtime itself is applied when the directory is finalized.
                Some(state) if state.mtime() != *mtime => Decision::Modified,
                Some(_) => Decision::NoChange,
            },
            EntryKind::Fifo { .. } => match &existing {
                None => {
                    mkfifo(&local, Mode::from_bits_truncate(entry.permissions as _)).map_err(io::Error::from)?;
                    Decision::Modified
                }
                Some(_) => Decision::NoChange,
            },
            EntryKind::Regular { size, mtime } => match &existing {
                None => {
                    File::create(&local)?;
                    awaiting_content = true;
                    Decision::ModifiedRequestData
                }
                Some(state) if self.verify_content || state.size() != *size || state.mtime() != *mtime => {
                    awaiting_content = true;
                    Decision::ModifiedRequestData
                }
                Some(_) => Decision::NoChange,
            },
            EntryKind::Symlink { target } => match &existing {
                Some(_) if fs::read_link(&local)? == *target => Decision::NoChange,
                Some(_) => {
                    fs::remove_file(&local)?;
                    symlink(target, &local)?;
                    Decision::Modified
                }
                None => {
                    symlink(target, &local)?;
                    Decision::Modified
                }
            },
        };

        let corrected = self.correct_metadata(entry, &local, awaiting_content);
        if decision == Decision::NoChange && corrected {
            Ok(Decision::Modified)
        } else {
            Ok(decision)
        }
    }

    /// Bring owner, permissions and mtime in line. Failures are logged, never fatal.
    fn correct_metadata(&self, entry: &FileEntry, local: &Path, awaiting_content: bool) -> bool {
        let state = match DiskState::probe(local) {
            Ok(Some(state)) => state,
            Ok(None) => {
                warn!(path = %local.display(), "Node vanished before metadata could be applied");
                return false;
            }
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Failed to stat node");
                return false;
            }
        };
        let mut corrected = false;

        // Ownership first: chown clears setuid/setgid bits, so the mode is
        // rewritten whenever the owner changed.
        let mut owner_changed = false;
        if state.uid() != entry.uid || state.gid() != entry.gid {
            match lchown(local, Some(entry.uid), Some(entry.gid)) {
                Ok(()) => owner_changed = true,
                Err(e) => warn!(path = %local.display(), error = %e, "Failed to set owner"),
            }
        }
        corrected |= owner_changed;

        let kind = entry.kind.file_kind();
        if kind != FileKind::Symlink && (owner_changed || state.permissions() != entry.permissions) {
            match set_permissions(local, entry.permissions) {
                Ok(()) => corrected = true,
                Err(e) => warn!(path = %local.display(), error = %e, "Failed to set permissions"),
            }
        }

        if let Some(mtime) = entry.kind.mtime() {
            if kind != FileKind::Directory && !awaiting_content && state.mtime() != mtime {
                match set_mtime(local, mtime) {
                    Ok(()) => corrected = true,
                    Err(e) => warn!(path = %local.display(), error = %e, "Failed to set mtime"),
                }
            }
        }

        corrected
    }
}

fn make_device(path: &Path, kind: FileKind, permissions: u32, device: u64) -> io::Result<()> {
    let flag = if kind == FileKind::BlockDevice {
        SFlag::S_IFBLK
    } else {
        SFlag::S_IFCHR
    };
    mknod(path, flag, Mode::from_bits_truncate(permissions as _), device as _)?;
    Ok(())
}
