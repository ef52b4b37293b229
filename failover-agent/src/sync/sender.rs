//! Source side of a replication session.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::content::send_file;
use crate::fs::paths::local_path;
use crate::fs::Batches;
use crate::protocol::entry::write_entry;
use crate::protocol::wire::expect_reply;
use crate::protocol::{BatchHeader, ControlCode, Decision, EntryKind, FileEntry};
use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub batches: u64,
    pub scanned: u64,
    /// Entries the receiver reported as changed.
    pub updated: u64,
    pub content_bytes: u64,
}

/// Drive a full run over an already negotiated session.
///
/// Batches are produced on the blocking pool. The walk finishes with the
/// end marker, after which the receiver's final `DONE` confirms that every
/// directory has been reconciled.
pub async fn send_tree<R, W>(reader: &mut R, writer: &mut W, batches: Batches) -> Result<SendStats>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let root: PathBuf = batches.root().to_path_buf();
    let mut stats = SendStats::default();
    let mut walker = batches;

    loop {
        let (returned, next) = tokio::task::spawn_blocking(move || {
            let next = walker.next();
            (walker, next)
        })
        .await?;
        walker = returned;
        let Some(batch) = next.transpose()? else {
            break;
        };

        let decisions = exchange_batch(reader, writer, &batch).await?;
        stats.batches += 1;
        stats.scanned += batch.len() as u64;

        for (entry, decision) in batch.iter().zip(&decisions) {
            if decision.is_change() {
                stats.updated += 1;
            }
            if !decision.requests_data() {
                continue;
            }
            if !matches!(entry.kind, EntryKind::Regular { .. }) {
                return Err(AgentError::Protocol(format!(
                    "receiver requested content for non-regular entry {}",
                    entry.path.display()
                )));
            }
            stats.content_bytes += send_file(writer, &local_path(&root, &entry.path)).await?;
        }
        writer.flush().await?;
        expect_reply(reader, ControlCode::Proceed).await?;
        debug!(batch = stats.batches, entries = batch.len(), "Batch applied by receiver");
    }

    BatchHeader::End.write(writer).await?;
    writer.flush().await?;
    expect_reply(reader, ControlCode::Done).await?;
    Ok(stats)
}

async fn exchange_batch<R, W>(reader: &mut R, writer: &mut W, batch: &[FileEntry]) -> Result<Vec<Decision>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let count = u32::try_from(batch.len())
        .map_err(|_| AgentError::Config(format!("batch of {} entries is too large", batch.len())))?;
    BatchHeader::Entries(count).write(writer).await?;
    for entry in batch {
        write_entry(writer, Some(entry)).await?;
    }
    writer.flush().await?;

    expect_reply(reader, ControlCode::Proceed).await?;
    let mut decisions = Vec::with_capacity(batch.len());
    for _ in batch {
        decisions.push(Decision::from_byte(reader.read_u8().await?)?);
    }
    Ok(decisions)
}
