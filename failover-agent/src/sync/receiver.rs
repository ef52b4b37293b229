//! Destination side of a replication session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::content::receive_file;
use super::decision::DecisionEngine;
use super::reconciler::DirectoryReconciler;
use crate::fs::ExclusionRegistry;
use crate::protocol::entry::read_entry;
use crate::protocol::wire::{write_control, write_error};
use crate::protocol::{BatchHeader, ControlCode, EntryKind, FileEntry};
use crate::utils::blocking;
use crate::utils::errors::Result;

/// Headers are untrusted; larger batches grow as entries arrive.
const MAX_PREALLOCATED: usize = 4096;

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub verify_content: bool,
    /// Local no-copy list; matching destination children are never deleted.
    pub exclusions: Arc<ExclusionRegistry>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            verify_content: false,
            exclusions: Arc::new(ExclusionRegistry::empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub entries: u64,
    pub changed: u64,
    pub content_bytes: u64,
    pub removed: u64,
}

/// Apply a full run into `root`.
///
/// Any failure is reported to the sender (best effort) before it is returned.
pub async fn receive_tree<R, W>(reader: &mut R, writer: &mut W, root: &Path, options: &ReceiveOptions) -> Result<ReceiveStats>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let result = receive_batches(reader, writer, root, options).await;
    if let Err(e) = &result {
        if let Err(report) = write_error(writer, e).await {
            debug!(error = %report, "Could not report failure to sender");
        }
    }
    result
}

async fn receive_batches<R, W>(reader: &mut R, writer: &mut W, root: &Path, options: &ReceiveOptions) -> Result<ReceiveStats>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let engine = DecisionEngine::new(root, options.verify_content);
    let mut reconciler = DirectoryReconciler::new(options.exclusions.clone());
    let mut stats = ReceiveStats::default();

    loop {
        let count = match BatchHeader::read(reader).await? {
            BatchHeader::Entries(count) => count,
            BatchHeader::End => break,
        };

        let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOCATED));
        for _ in 0..count {
            if let Some(entry) = read_entry(reader).await? {
                entries.push(entry);
            }
        }

        let batch_engine = engine.clone();
        let (returned, applied) = blocking(move || {
            let applied = apply_batch(&batch_engine, &mut reconciler, &entries)?;
            Ok((reconciler, applied))
        })
        .await?;
        reconciler = returned;
        stats.entries += applied.decisions.len() as u64;
        stats.changed += applied.changed;

        write_control(writer, ControlCode::Proceed).await?;
        writer.write_all(&applied.decisions).await?;
        writer.flush().await?;

        for (local, mtime) in &applied.awaiting {
            stats.content_bytes += receive_file(reader, local, *mtime).await?;
        }
        let (returned, removed) = blocking(move || {
            let removed = reconciler.finalize_pending()?;
            Ok((reconciler, removed))
        })
        .await?;
        reconciler = returned;
        stats.removed += removed;

        write_control(writer, ControlCode::Proceed).await?;
        writer.flush().await?;
    }

    stats.removed += blocking(move || reconciler.finish()).await?;
    write_control(writer, ControlCode::Done).await?;
    writer.flush().await?;
    Ok(stats)
}

/// Decisions for one batch, in request order.
struct AppliedBatch {
    decisions: Vec<u8>,
    /// Regular files whose content follows, with the mtime to stamp afterwards.
    awaiting: Vec<(PathBuf, i64)>,
    changed: u64,
}

fn apply_batch(engine: &DecisionEngine, reconciler: &mut DirectoryReconciler, entries: &[FileEntry]) -> Result<AppliedBatch> {
    let mut applied = AppliedBatch {
        decisions: Vec::with_capacity(entries.len()),
        awaiting: Vec::new(),
        changed: 0,
    };
    for entry in entries {
        reconciler.enter(&entry.path)?;
        let decision = engine.apply(entry)?;
        match entry.kind {
            EntryKind::Directory { mtime } => {
                reconciler.push(&entry.path, engine.local_path(&entry.path), mtime);
            }
            EntryKind::Regular { mtime, .. } if decision.requests_data() => {
                applied.awaiting.push((engine.local_path(&entry.path), mtime));
            }
            _ => {}
        }
        if decision.is_change() {
            applied.changed += 1;
        }
        applied.decisions.push(decision.to_byte());
    }
    Ok(applied)
}
