use super::{from_db_time, to_db_time};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of the append-only replication log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRun {
    pub id: String,
    pub target_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub scanned: u64,
    pub updated: u64,
    /// Bytes in plus bytes out on the wire.
    pub bytes: u64,
    pub error: Option<String>,
}

impl ReplicationRun {
    pub fn new(target_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            started_at,
            finished_at: started_at,
            success: false,
            scanned: 0,
            updated: 0,
            bytes: 0,
            error: None,
        }
    }
}

fn row_to_run(row: &Row) -> rusqlite::Result<ReplicationRun> {
    let started: String = row.get("started_at")?;
    let finished: String = row.get("finished_at")?;
    let scanned: i64 = row.get("scanned")?;
    let updated: i64 = row.get("updated")?;
    let bytes: i64 = row.get("bytes")?;
    Ok(ReplicationRun {
        id: row.get("id")?,
        target_id: row.get("target_id")?,
        started_at: from_db_time(2, &started)?,
        finished_at: from_db_time(3, &finished)?,
        success: row.get("success")?,
        scanned: scanned.max(0) as u64,
        updated: updated.max(0) as u64,
        bytes: bytes.max(0) as u64,
        error: row.get("error")?,
    })
}

pub fn append(conn: &Connection, run: &ReplicationRun) -> Result<()> {
    conn.execute(
        "INSERT INTO replication_runs
           (id, target_id, started_at, finished_at, success, scanned, updated, bytes, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run.id,
            run.target_id,
            to_db_time(&run.started_at),
            to_db_time(&run.finished_at),
            run.success,
            run.scanned as i64,
            run.updated as i64,
            run.bytes as i64,
            run.error
        ],
    )?;
    Ok(())
}

/// The most recently appended run. Insertion order, not `started_at`, decides
/// recency, so a run stamped in the future by a skewed clock is still "last".
pub fn last_for_target(conn: &Connection, target_id: &str) -> Result<Option<ReplicationRun>> {
    Ok(conn
        .query_row(
            "SELECT * FROM replication_runs WHERE target_id = ? ORDER BY rowid DESC LIMIT 1",
            params![target_id],
            row_to_run,
        )
        .optional()?)
}

pub fn recent_for_target(conn: &Connection, target_id: &str, limit: usize) -> Result<Vec<ReplicationRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM replication_runs WHERE target_id = ? ORDER BY rowid DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![target_id, limit as i64], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
