//! File entry representation and its wire codec.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::wire;
use crate::utils::errors::{AgentError, Result};

/// Largest number of entry slots accepted in one batch.
pub const MAX_BATCH: u32 = 1_000_000;

const S_IFMT: u32 = 0o170000;
const PERMISSION_BITS: u32 = 0o7777;

/// Node types that can be replicated. Sockets are never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl FileKind {
    pub const fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => 0o100000,
            FileKind::Directory => 0o040000,
            FileKind::Symlink => 0o120000,
            FileKind::BlockDevice => 0o060000,
            FileKind::CharDevice => 0o020000,
            FileKind::Fifo => 0o010000,
        }
    }

    /// Classify a full `st_mode`. Sockets and unknown types yield `None`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            0o100000 => Some(FileKind::Regular),
            0o040000 => Some(FileKind::Directory),
            0o120000 => Some(FileKind::Symlink),
            0o060000 => Some(FileKind::BlockDevice),
            0o020000 => Some(FileKind::CharDevice),
            0o010000 => Some(FileKind::Fifo),
            _ => None,
        }
    }
}

/// Kind-specific attributes. Symlinks carry no mtime and only regular files a size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Regular { size: u64, mtime: i64 },
    Directory { mtime: i64 },
    Symlink { target: PathBuf },
    BlockDevice { device: u64, mtime: i64 },
    CharDevice { device: u64, mtime: i64 },
    Fifo { mtime: i64 },
}

impl EntryKind {
    pub fn file_kind(&self) -> FileKind {
        match self {
            EntryKind::Regular { .. } => FileKind::Regular,
            EntryKind::Directory { .. } => FileKind::Directory,
            EntryKind::Symlink { .. } => FileKind::Symlink,
            EntryKind::BlockDevice { .. } => FileKind::BlockDevice,
            EntryKind::CharDevice { .. } => FileKind::CharDevice,
            EntryKind::Fifo { .. } => FileKind::Fifo,
        }
    }

    /// Modification time in milliseconds, absent for symlinks.
    pub fn mtime(&self) -> Option<i64> {
        match *self {
            EntryKind::Regular { mtime, .. }
            | EntryKind::Directory { mtime }
            | EntryKind::BlockDevice { mtime, .. }
            | EntryKind::CharDevice { mtime, .. }
            | EntryKind::Fifo { mtime } => Some(mtime),
            EntryKind::Symlink { .. } => None,
        }
    }
}

/// One node of the replicated tree as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute within the replicated tree; `/` is the tree root.
    pub path: PathBuf,
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub kind: EntryKind,
}

impl FileEntry {
    /// Full mode: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.file_kind().type_bits() | (self.permissions & PERMISSION_BITS)
    }
}

/// Batch framing: a count of entry slots, or the end-of-run marker (`-1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchHeader {
    Entries(u32),
    End,
}

impl BatchHeader {
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(self, w: &mut W) -> Result<()> {
        let value = match self {
            BatchHeader::Entries(count) => i64::from(count),
            BatchHeader::End => -1,
        };
        wire::write_varint(w, value).await
    }

    pub async fn read<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Self> {
        match wire::read_varint(r).await? {
            -1 => Ok(BatchHeader::End),
            count if (0..=i64::from(MAX_BATCH)).contains(&count) => Ok(BatchHeader::Entries(count as u32)),
            other => Err(AgentError::Protocol(format!("invalid batch header {}", other))),
        }
    }
}

fn clamp_id(id: u32, what: &str, path: &Path) -> u16 {
    u16::try_from(id).unwrap_or_else(|_| {
        warn!(path = %path.display(), id, "{} does not fit the wire format, sending 0", what);
        0
    })
}

/// Encode one entry slot. `None` marks an absent entry.
pub async fn write_entry<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, entry: Option<&FileEntry>) -> Result<()> {
    let Some(entry) = entry else {
        return wire::write_bool(w, false).await;
    };
    wire::write_bool(w, true).await?;
    wire::write_bytes(w, entry.path.as_os_str().as_bytes()).await?;
    wire::write_uvarint(w, u64::from(entry.mode())).await?;
    if let EntryKind::Regular { size, .. } = entry.kind {
        wire::write_uvarint(w, size).await?;
    }
    w.write_u16(clamp_id(entry.uid, "uid", &entry.path)).await?;
    w.write_u16(clamp_id(entry.gid, "gid", &entry.path)).await?;
    if let Some(mtime) = entry.kind.mtime() {
        w.write_i64(mtime).await?;
    }
    match &entry.kind {
        EntryKind::Symlink { target } => wire::write_bytes(w, target.as_os_str().as_bytes()).await?,
        EntryKind::BlockDevice { device, .. } | EntryKind::CharDevice { device, .. } => {
            wire::write_uvarint(w, *device).await?
        }
        _ => {}
    }
    Ok(())
}

/// Decode one entry slot, validating the path and the node type.
pub async fn read_entry<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Option<FileEntry>> {
    if !wire::read_bool(r).await? {
        return Ok(None);
    }
    let path = PathBuf::from(OsStr::from_bytes(&wire::read_bytes(r).await?));
    validate_wire_path(&path)?;

    let mode = u32::try_from(wire::read_uvarint(r).await?)
        .map_err(|_| AgentError::Protocol(format!("mode out of range for {}", path.display())))?;
    let file_kind = FileKind::from_mode(mode).ok_or_else(|| {
        AgentError::Protocol(format!("unsupported file type {:o} for {}", mode & S_IFMT, path.display()))
    })?;

    let size = match file_kind {
        FileKind::Regular => wire::read_uvarint(r).await?,
        _ => 0,
    };
    let uid = u32::from(r.read_u16().await?);
    let gid = u32::from(r.read_u16().await?);
    let mtime = match file_kind {
        FileKind::Symlink => 0,
        _ => r.read_i64().await?,
    };

    let kind = match file_kind {
        FileKind::Regular => EntryKind::Regular { size, mtime },
        FileKind::Directory => EntryKind::Directory { mtime },
        FileKind::Fifo => EntryKind::Fifo { mtime },
        FileKind::Symlink => EntryKind::Symlink {
            target: PathBuf::from(OsStr::from_bytes(&wire::read_bytes(r).await?)),
        },
        FileKind::BlockDevice => EntryKind::BlockDevice {
            device: wire::read_uvarint(r).await?,
            mtime,
        },
        FileKind::CharDevice => EntryKind::CharDevice {
            device: wire::read_uvarint(r).await?,
            mtime,
        },
    };

    Ok(Some(FileEntry {
        path,
        permissions: mode & PERMISSION_BITS,
        uid,
        gid,
        kind,
    }))
}

/// Wire paths are absolute and may only contain normal components below the root.
pub fn validate_wire_path(path: &Path) -> Result<()> {
    let mut components = path.components();
    if components.next() != Some(Component::RootDir) {
        return Err(AgentError::Protocol(format!("path {} is not absolute", path.display())));
    }
    if components.any(|c| !matches!(c, Component::Normal(_))) {
        return Err(AgentError::Protocol(format!(
            "path {} escapes the replicated tree",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            permissions: 0o644,
            uid: 1000,
            gid: 1000,
            kind: EntryKind::Regular {
                size,
                mtime: 1_700_000_000_123,
            },
        }
    }

    async fn encode(entries: &[Option<FileEntry>]) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in entries {
            write_entry(&mut buf, entry.as_ref()).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_regular_entry_layout() {
        let buf = encode(&[Some(regular("/a", 5))]).await;
        let mut expected = vec![1u8, 2, b'/', b'a'];
        expected.extend_from_slice(&[0xa4, 0x83, 0x02]); // 0o100644
        expected.push(5);
        expected.extend_from_slice(&1000u16.to_be_bytes());
        expected.extend_from_slice(&1000u16.to_be_bytes());
        expected.extend_from_slice(&1_700_000_000_123i64.to_be_bytes());
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_every_kind_decodes_back() {
        let entries = vec![
            Some(FileEntry {
                path: PathBuf::from("/"),
                permissions: 0o755,
                uid: 0,
                gid: 0,
                kind: EntryKind::Directory { mtime: -5 },
            }),
            Some(FileEntry {
                path: PathBuf::from("/link"),
                permissions: 0o777,
                uid: 1,
                gid: 2,
                kind: EntryKind::Symlink {
                    target: PathBuf::from("../elsewhere"),
                },
            }),
            None,
            Some(FileEntry {
                path: PathBuf::from("/dev/sda"),
                permissions: 0o660,
                uid: 0,
                gid: 6,
                kind: EntryKind::BlockDevice {
                    device: 0x0800,
                    mtime: 42,
                },
            }),
            Some(FileEntry {
                path: PathBuf::from("/pipe"),
                permissions: 0o600,
                uid: 0,
                gid: 0,
                kind: EntryKind::Fifo { mtime: 7 },
            }),
        ];
        let buf = encode(&entries).await;
        let mut reader = &buf[..];
        for expected in &entries {
            assert_eq!(&read_entry(&mut reader).await.unwrap(), expected);
        }
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_large_ids_are_sent_as_zero() {
        let mut entry = regular("/big", 0);
        entry.uid = 70_000;
        entry.gid = 65_535;
        let buf = encode(&[Some(entry)]).await;
        let mut reader = &buf[..];
        let decoded = read_entry(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.uid, 0);
        assert_eq!(decoded.gid, 65_535);
    }

    #[tokio::test]
    async fn test_socket_mode_is_protocol_error() {
        let mut buf = Vec::new();
        wire::write_bool(&mut buf, true).await.unwrap();
        wire::write_bytes(&mut buf, b"/sock").await.unwrap();
        wire::write_uvarint(&mut buf, 0o140755).await.unwrap();
        let mut reader = &buf[..];
        assert!(matches!(read_entry(&mut reader).await, Err(AgentError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_escaping_paths_rejected() {
        for bad in ["relative", "/a/../../etc", ""] {
            let mut buf = Vec::new();
            wire::write_bool(&mut buf, true).await.unwrap();
            wire::write_bytes(&mut buf, bad.as_bytes()).await.unwrap();
            let mut reader = &buf[..];
            assert!(
                matches!(read_entry(&mut reader).await, Err(AgentError::Protocol(_))),
                "{} accepted",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_batch_header_bounds() {
        let mut buf = Vec::new();
        BatchHeader::End.write(&mut buf).await.unwrap();
        BatchHeader::Entries(3).write(&mut buf).await.unwrap();
        wire::write_varint(&mut buf, -2).await.unwrap();
        let mut reader = &buf[..];
        assert_eq!(BatchHeader::read(&mut reader).await.unwrap(), BatchHeader::End);
        assert_eq!(BatchHeader::read(&mut reader).await.unwrap(), BatchHeader::Entries(3));
        assert!(matches!(BatchHeader::read(&mut reader).await, Err(AgentError::Protocol(_))));
    }
}
