//! Node metadata in replication terms.
//!
//! Reads `lstat` results into [`FileEntry`] values on the source, and inspects
//! and corrects destination nodes on the receiver.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::protocol::{EntryKind, FileEntry, FileKind};

/// Modification time in whole milliseconds since the epoch.
pub fn mtime_millis(meta: &Metadata) -> i64 {
    meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000
}

pub fn file_time_from_millis(millis: i64) -> FileTime {
    FileTime::from_unix_time(millis.div_euclid(1000), (millis.rem_euclid(1000) * 1_000_000) as u32)
}

/// Set the modification time, leaving the access time untouched.
///
/// Works on the path itself and never opens it, so FIFOs and device nodes
/// are safe to stamp.
pub fn set_mtime(path: &Path, millis: i64) -> io::Result<()> {
    let atime = FileTime::from_last_access_time(&fs::symlink_metadata(path)?);
    filetime::set_symlink_file_times(path, atime, file_time_from_millis(millis))
}

pub fn set_permissions(path: &Path, permissions: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(permissions))
}

/// Describe a source node. Sockets and unknown types yield `None`.
///
/// `local` is only read for symlink targets; a target that vanished
/// surfaces as `NotFound` so the walker can drop the entry.
pub fn entry_from_metadata(wire: PathBuf, local: &Path, meta: &Metadata) -> io::Result<Option<FileEntry>> {
    let Some(kind) = FileKind::from_mode(meta.mode()) else {
        return Ok(None);
    };
    let mtime = mtime_millis(meta);
    let kind = match kind {
        FileKind::Regular => EntryKind::Regular { size: meta.len(), mtime },
        FileKind::Directory => EntryKind::Directory { mtime },
        FileKind::Symlink => EntryKind::Symlink {
            target: fs::read_link(local)?,
        },
        FileKind::BlockDevice => EntryKind::BlockDevice { device: meta.rdev(), mtime },
        FileKind::CharDevice => EntryKind::CharDevice { device: meta.rdev(), mtime },
        FileKind::Fifo => EntryKind::Fifo { mtime },
    };
    Ok(Some(FileEntry {
        path: wire,
        permissions: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        kind,
    }))
}

/// What currently occupies a destination path.
#[derive(Debug, Clone)]
pub struct DiskState {
    meta: Metadata,
}

impl DiskState {
    /// `lstat` the path; a missing node is `Ok(None)`.
    pub fn probe(path: &Path) -> io::Result<Option<Self>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(Self { meta })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.meta.mode())
    }

    pub fn permissions(&self) -> u32 {
        self.meta.mode() & 0o7777
    }

    pub fn uid(&self) -> u32 {
        self.meta.uid()
    }

    pub fn gid(&self) -> u32 {
        self.meta.gid()
    }

    pub fn size(&self) -> u64 {
        self.meta.len()
    }

    pub fn mtime(&self) -> i64 {
        mtime_millis(&self.meta)
    }

    pub fn device(&self) -> u64 {
        self.meta.rdev()
    }
}

/// Remove whatever is at `path`, recursing into real directories. Missing is fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
