use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A managed server as known to the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    /// Network zone; replication between zones may be compressed.
    pub zone: String,
    /// The server this one fails over to, if any.
    pub failover_parent: Option<String>,
}

impl Server {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

fn row_to_server(row: &Row) -> rusqlite::Result<Server> {
    let port: i64 = row.get("port")?;
    Ok(Server {
        name: row.get("name")?,
        hostname: row.get("hostname")?,
        port: u16::try_from(port).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        zone: row.get("zone")?,
        failover_parent: row.get("failover_parent")?,
    })
}

pub fn find_all(conn: &Connection) -> Result<Vec<Server>> {
    let mut stmt = conn.prepare("SELECT * FROM servers ORDER BY name")?;
    let rows = stmt.query_map([], row_to_server)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Server>> {
    Ok(conn
        .query_row(
            "SELECT * FROM servers WHERE name = ?",
            params![name],
            row_to_server,
        )
        .optional()?)
}

/// Insert or replace a server record.
pub fn upsert(conn: &Connection, server: &Server) -> Result<()> {
    conn.execute(
        "INSERT INTO servers (name, hostname, port, zone, failover_parent)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
           hostname = excluded.hostname,
           port = excluded.port,
           zone = excluded.zone,
           failover_parent = excluded.failover_parent",
        params![
            server.name,
            server.hostname,
            server.port as i64,
            server.zone,
            server.failover_parent
        ],
    )?;
    Ok(())
}

pub fn add_backup_mount(conn: &Connection, server: &str, path: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO backup_mounts (server, path) VALUES (?1, ?2)",
        params![server, path],
    )?;
    Ok(())
}

/// Mount points of backup storage on `server`; never replicated.
pub fn backup_mounts(conn: &Connection, server: &str) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare("SELECT path FROM backup_mounts WHERE server = ? ORDER BY path")?;
    let rows = stmt.query_map(params![server], |row| row.get::<_, String>(0))?;
    Ok(rows
        .map(|r| r.map(PathBuf::from))
        .collect::<rusqlite::Result<Vec<_>>>()?)
}
