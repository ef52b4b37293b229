//! Whole-file content streaming.
//!
//! A file travels as `(NEXT, u16 length, payload)*` followed by `DONE`. The
//! sender always terminates the stream, even when the file vanished or a read
//! failed, so both sides stay in step.

use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::fs::metadata::set_mtime;
use crate::protocol::wire::{read_control, write_control};
use crate::protocol::ControlCode;
use crate::utils::errors::{AgentError, Result};

/// Largest payload of a single chunk.
pub const CHUNK_SIZE: usize = u16::MAX as usize;

/// Stream the file at `local`. Returns the number of payload bytes sent.
pub async fn send_file<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, local: &Path) -> Result<u64> {
    let mut file = match File::open(local).await {
        Ok(file) => file,
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound {
                debug!(path = %local.display(), "File vanished before its content was sent");
            } else {
                warn!(path = %local.display(), error = %e, "Cannot open file for sending");
            }
            write_control(w, ControlCode::Done).await?;
            return Ok(0);
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Read failed mid-file, ending stream early");
                break;
            }
        };
        write_control(w, ControlCode::Next).await?;
        w.write_u16(n as u16).await?;
        w.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    write_control(w, ControlCode::Done).await?;
    Ok(sent)
}

/// Receive a content stream into `local`, truncate to what arrived, then stamp `mtime`.
pub async fn receive_file<R: AsyncRead + Unpin + ?Sized>(r: &mut R, local: &Path, mtime: i64) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(local).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        match read_control(r).await? {
            ControlCode::Next => {
                let len = usize::from(r.read_u16().await?);
                r.read_exact(&mut buf[..len]).await?;
                file.write_all(&buf[..len]).await?;
                written += len as u64;
            }
            ControlCode::Done => break,
            other => {
                return Err(AgentError::Protocol(format!(
                    "unexpected {:?} inside content stream for {}",
                    other,
                    local.display()
                )))
            }
        }
    }
    file.flush().await?;
    file.set_len(written).await?;
    drop(file);

    let stamped = local.to_path_buf();
    if let Err(e) = tokio::task::spawn_blocking(move || set_mtime(&stamped, mtime)).await? {
        warn!(path = %local.display(), error = %e, "Failed to set mtime after content");
    }
    Ok(written)
}
