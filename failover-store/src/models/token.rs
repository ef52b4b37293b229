use super::to_db_time;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// What an accepted token lets the receiving side do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveGrant {
    pub target_id: String,
    pub source: String,
    pub to_path: PathBuf,
}

/// Issue a token scoped to one replication relationship.
pub fn issue(conn: &Connection, target_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<String> {
    conn.execute(
        "DELETE FROM replication_tokens WHERE expires_at <= ?",
        params![to_db_time(&now)],
    )?;

    let token = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO replication_tokens (token, target_id, issued_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![token, target_id, to_db_time(&now), to_db_time(&(now + ttl))],
    )?;
    Ok(token)
}

/// Resolve a token into a grant. Expired tokens and disabled targets yield `None`.
pub fn authorize(conn: &Connection, token: &str, now: DateTime<Utc>) -> Result<Option<ReceiveGrant>> {
    Ok(conn
        .query_row(
            "SELECT t.id, t.source, t.to_path
               FROM replication_tokens k
               JOIN replication_targets t ON t.id = k.target_id
              WHERE k.token = ?1 AND k.expires_at > ?2 AND t.enabled = 1",
            params![token, to_db_time(&now)],
            |row| {
                let to_path: String = row.get(2)?;
                Ok(ReceiveGrant {
                    target_id: row.get(0)?,
                    source: row.get(1)?,
                    to_path: PathBuf::from(to_path),
                })
            },
        )
        .optional()?)
}
