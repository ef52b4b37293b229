use crate::error::{Result, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// A (source, destination) pair with its own schedule and bandwidth policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub id: String,
    pub source: String,
    pub destination: String,
    /// Root directory on the destination that mirrors the source's `/`.
    pub to_path: PathBuf,
    /// Hours of the day (0-23) in which a scheduled run may start.
    pub schedule_hours: BTreeSet<u32>,
    pub min_interval: Duration,
    /// Bytes per second, `-1` for unlimited.
    pub bandwidth_limit: i64,
    pub use_compression: bool,
    pub enabled: bool,
}

impl ReplicationTarget {
    /// The configured cap, or `None` when unlimited.
    pub fn bandwidth_cap(&self) -> Option<NonZeroU64> {
        u64::try_from(self.bandwidth_limit)
            .ok()
            .and_then(NonZeroU64::new)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTargetRequest {
    pub source: String,
    pub destination: String,
    pub to_path: PathBuf,
    #[serde(default)]
    pub schedule_hours: BTreeSet<u32>,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_bandwidth_limit")]
    pub bandwidth_limit: i64,
    #[serde(default = "default_use_compression")]
    pub use_compression: bool,
}

fn default_min_interval_secs() -> u64 { 3600 }
fn default_bandwidth_limit() -> i64 { -1 }
fn default_use_compression() -> bool { true }

fn row_to_target(row: &Row) -> rusqlite::Result<ReplicationTarget> {
    let hours: String = row.get("schedule_hours")?;
    let schedule_hours = serde_json::from_str(&hours).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let min_interval_secs: i64 = row.get("min_interval_secs")?;
    let to_path: String = row.get("to_path")?;

    Ok(ReplicationTarget {
        id: row.get("id")?,
        source: row.get("source")?,
        destination: row.get("destination")?,
        to_path: PathBuf::from(to_path),
        schedule_hours,
        min_interval: Duration::from_secs(min_interval_secs.max(0) as u64),
        bandwidth_limit: row.get("bandwidth_limit")?,
        use_compression: row.get("use_compression")?,
        enabled: row.get("enabled")?,
    })
}

/// Enabled targets replicating away from `source`.
pub fn find_by_source(conn: &Connection, source: &str) -> Result<Vec<ReplicationTarget>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM replication_targets WHERE source = ? AND enabled = 1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![source], row_to_target)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<ReplicationTarget>> {
    Ok(conn
        .query_row(
            "SELECT * FROM replication_targets WHERE id = ?",
            params![id],
            row_to_target,
        )
        .optional()?)
}

pub fn create(conn: &Connection, data: &CreateTargetRequest) -> Result<ReplicationTarget> {
    if let Some(hour) = data.schedule_hours.iter().find(|h| **h > 23) {
        return Err(StoreError::InvalidRecord(format!("schedule hour {} out of range", hour)));
    }

    let id = Uuid::new_v4().to_string();
    let hours = serde_json::to_string(&data.schedule_hours)?;
    conn.execute(
        "INSERT INTO replication_targets
           (id, source, destination, to_path, schedule_hours, min_interval_secs, bandwidth_limit, use_compression)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            data.source,
            data.destination,
            data.to_path.to_string_lossy().into_owned(),
            hours,
            data.min_interval_secs as i64,
            data.bandwidth_limit,
            data.use_compression
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| StoreError::NotFound("Failed to retrieve created target".into()))
}

pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> Result<bool> {
    let changes = conn.execute(
        "UPDATE replication_targets SET enabled = ?1 WHERE id = ?2",
        params![enabled, id],
    )?;
    Ok(changes > 0)
}
