use crate::db::connection::DbPool;
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
  name TEXT PRIMARY KEY,
  hostname TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 4180,
  zone TEXT NOT NULL DEFAULT 'default',
  failover_parent TEXT REFERENCES servers(name) ON DELETE SET NULL,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS backup_mounts (
  server TEXT NOT NULL REFERENCES servers(name) ON DELETE CASCADE,
  path TEXT NOT NULL,
  PRIMARY KEY (server, path)
);

CREATE TABLE IF NOT EXISTS replication_targets (
  id TEXT PRIMARY KEY,
  source TEXT NOT NULL REFERENCES servers(name) ON DELETE CASCADE,
  destination TEXT NOT NULL REFERENCES servers(name) ON DELETE CASCADE,
  to_path TEXT NOT NULL,
  schedule_hours TEXT NOT NULL DEFAULT '[]',
  min_interval_secs INTEGER NOT NULL DEFAULT 3600,
  bandwidth_limit INTEGER NOT NULL DEFAULT -1,
  use_compression INTEGER NOT NULL DEFAULT 1,
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS replication_tokens (
  token TEXT PRIMARY KEY,
  target_id TEXT NOT NULL REFERENCES replication_targets(id) ON DELETE CASCADE,
  issued_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS replication_runs (
  id TEXT PRIMARY KEY,
  target_id TEXT NOT NULL REFERENCES replication_targets(id) ON DELETE CASCADE,
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  success INTEGER NOT NULL,
  scanned INTEGER NOT NULL DEFAULT 0,
  updated INTEGER NOT NULL DEFAULT 0,
  bytes INTEGER NOT NULL DEFAULT 0,
  error TEXT
);

CREATE INDEX IF NOT EXISTS idx_replication_targets_source ON replication_targets(source);
CREATE INDEX IF NOT EXISTS idx_replication_runs_target ON replication_runs(target_id);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    let has_column = |table: &str, column: &str| -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("replication_runs", "error")? {
        conn.execute_batch("ALTER TABLE replication_runs ADD COLUMN error TEXT")?;
    }
    if !has_column("servers", "zone")? {
        conn.execute_batch(
            "ALTER TABLE servers ADD COLUMN zone TEXT NOT NULL DEFAULT 'default'",
        )?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
