//! Collaborator traits and their SQLite implementation.
//!
//! Every method blocks on the database; async callers wrap calls in
//! `tokio::task::spawn_blocking`.

use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::error::Result;
use crate::models::{replication_run, replication_target, server, token};
use crate::{ReceiveGrant, ReplicationRun, ReplicationTarget, Server};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Read-only view of the fleet inventory, plus token issuance.
pub trait Inventory: Send + Sync {
    /// Enabled targets whose source is `source`.
    fn targets_for_source(&self, source: &str) -> Result<Vec<ReplicationTarget>>;

    fn target(&self, id: &str) -> Result<Option<ReplicationTarget>>;

    fn server(&self, name: &str) -> Result<Option<Server>>;

    /// The server `server` currently fails over to.
    fn failover_parent(&self, server: &str) -> Result<Option<String>>;

    /// Backup storage mount points on `server`.
    fn backup_mount_points(&self, server: &str) -> Result<Vec<PathBuf>>;

    /// Issue a relationship-scoped authorization token for `target_id`.
    fn issue_token(&self, target_id: &str) -> Result<String>;

    /// Resolve a token presented by a connecting source.
    fn authorize(&self, token: &str) -> Result<Option<ReceiveGrant>>;
}

/// Append-only history of replication runs.
pub trait ReplicationLog: Send + Sync {
    fn append(&self, run: &ReplicationRun) -> Result<()>;

    fn last_run(&self, target_id: &str) -> Result<Option<ReplicationRun>>;

    /// Newest first.
    fn recent_runs(&self, target_id: &str, limit: usize) -> Result<Vec<ReplicationRun>>;
}

/// Lifetime of issued tokens; only checked at session handshake.
const TOKEN_TTL_MINUTES: i64 = 10;

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = create_pool(path, pool_size)?;
        migrate(&pool)?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn upsert_server(&self, record: &Server) -> Result<()> {
        let conn = self.pool.get()?;
        server::upsert(&conn, record)
    }

    pub fn add_backup_mount(&self, server_name: &str, path: &str) -> Result<()> {
        let conn = self.pool.get()?;
        server::add_backup_mount(&conn, server_name, path)
    }

    pub fn create_target(&self, request: &replication_target::CreateTargetRequest) -> Result<ReplicationTarget> {
        let conn = self.pool.get()?;
        replication_target::create(&conn, request)
    }

    pub fn set_target_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.pool.get()?;
        replication_target::set_enabled(&conn, id, enabled)
    }
}

impl Inventory for SqliteStore {
    fn targets_for_source(&self, source: &str) -> Result<Vec<ReplicationTarget>> {
        let conn = self.pool.get()?;
        replication_target::find_by_source(&conn, source)
    }

    fn target(&self, id: &str) -> Result<Option<ReplicationTarget>> {
        let conn = self.pool.get()?;
        replication_target::find_by_id(&conn, id)
    }

    fn server(&self, name: &str) -> Result<Option<Server>> {
        let conn = self.pool.get()?;
        server::find_by_name(&conn, name)
    }

    fn failover_parent(&self, name: &str) -> Result<Option<String>> {
        Ok(self.server(name)?.and_then(|s| s.failover_parent))
    }

    fn backup_mount_points(&self, name: &str) -> Result<Vec<PathBuf>> {
        let conn = self.pool.get()?;
        server::backup_mounts(&conn, name)
    }

    fn issue_token(&self, target_id: &str) -> Result<String> {
        let conn = self.pool.get()?;
        token::issue(
            &conn,
            target_id,
            chrono::Duration::minutes(TOKEN_TTL_MINUTES),
            Utc::now(),
        )
    }

    fn authorize(&self, presented: &str) -> Result<Option<ReceiveGrant>> {
        let conn = self.pool.get()?;
        token::authorize(&conn, presented, Utc::now())
    }
}

impl ReplicationLog for SqliteStore {
    fn append(&self, run: &ReplicationRun) -> Result<()> {
        let conn = self.pool.get()?;
        replication_run::append(&conn, run)
    }

    fn last_run(&self, target_id: &str) -> Result<Option<ReplicationRun>> {
        let conn = self.pool.get()?;
        replication_run::last_for_target(&conn, target_id)
    }

    fn recent_runs(&self, target_id: &str, limit: usize) -> Result<Vec<ReplicationRun>> {
        let conn = self.pool.get()?;
        replication_run::recent_for_target(&conn, target_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreateTargetRequest;
    use chrono::Duration;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn server(name: &str, zone: &str, parent: Option<&str>) -> Server {
        Server {
            name: name.to_string(),
            hostname: format!("{}.example.net", name),
            port: 4180,
            zone: zone.to_string(),
            failover_parent: parent.map(str::to_string),
        }
    }

    fn open_store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::open(&dir.path().join("inventory.db"), 2).unwrap();
        store.upsert_server(&server("web1", "east", None)).unwrap();
        store.upsert_server(&server("backup1", "west", None)).unwrap();
        store
    }

    fn target_request() -> CreateTargetRequest {
        CreateTargetRequest {
            source: "web1".into(),
            destination: "backup1".into(),
            to_path: PathBuf::from("/var/failover/web1"),
            schedule_hours: BTreeSet::from([2, 14]),
            min_interval_secs: 7200,
            bandwidth_limit: 1_000_000,
            use_compression: true,
        }
    }

    #[test]
    fn test_create_and_list_targets() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let target = store.create_target(&target_request()).unwrap();
        assert_eq!(target.schedule_hours, BTreeSet::from([2, 14]));
        assert_eq!(target.min_interval, std::time::Duration::from_secs(7200));
        assert_eq!(target.bandwidth_cap().map(|c| c.get()), Some(1_000_000));

        let listed = store.targets_for_source("web1").unwrap();
        assert_eq!(listed, vec![target.clone()]);
        assert!(store.targets_for_source("backup1").unwrap().is_empty());

        store.set_target_enabled(&target.id, false).unwrap();
        assert!(store.targets_for_source("web1").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_out_of_range_hour() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut request = target_request();
        request.schedule_hours.insert(24);
        assert!(store.create_target(&request).is_err());
    }

    #[test]
    fn test_unlimited_bandwidth_has_no_cap() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut request = target_request();
        request.bandwidth_limit = -1;
        let target = store.create_target(&request).unwrap();
        assert!(target.bandwidth_cap().is_none());
    }

    #[test]
    fn test_last_run_follows_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let target = store.create_target(&target_request()).unwrap();

        assert!(store.last_run(&target.id).unwrap().is_none());

        let now = Utc::now();
        let mut first = ReplicationRun::new(&target.id, now + Duration::hours(5));
        first.success = true;
        store.append(&first).unwrap();

        let mut second = ReplicationRun::new(&target.id, now);
        second.scanned = 42;
        second.bytes = 1024;
        second.error = Some("connection refused".into());
        store.append(&second).unwrap();

        let last = store.last_run(&target.id).unwrap().unwrap();
        assert_eq!(last.id, second.id);
        assert!(!last.success);
        assert_eq!(last.scanned, 42);
        assert_eq!(last.error.as_deref(), Some("connection refused"));

        let recent = store.recent_runs(&target.id, 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second.id);
        assert_eq!(recent[1].id, first.id);
    }

    #[test]
    fn test_token_authorizes_its_target_only_while_enabled() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let target = store.create_target(&target_request()).unwrap();

        let token = store.issue_token(&target.id).unwrap();
        let grant = store.authorize(&token).unwrap().unwrap();
        assert_eq!(grant.target_id, target.id);
        assert_eq!(grant.source, "web1");
        assert_eq!(grant.to_path, PathBuf::from("/var/failover/web1"));

        assert!(store.authorize("not-a-token").unwrap().is_none());

        store.set_target_enabled(&target.id, false).unwrap();
        assert!(store.authorize(&token).unwrap().is_none());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let target = store.create_target(&target_request()).unwrap();

        let conn = store.pool().get().unwrap();
        let issued_at = Utc::now() - Duration::hours(2);
        let token = token::issue(&conn, &target.id, Duration::minutes(10), issued_at).unwrap();
        assert!(token::authorize(&conn, &token, Utc::now()).unwrap().is_none());
        assert!(token::authorize(&conn, &token, issued_at).unwrap().is_some());
    }

    #[test]
    fn test_failover_parent_and_mounts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert_server(&server("web2", "east", Some("backup1"))).unwrap();
        store.add_backup_mount("web2", "/backup").unwrap();
        store.add_backup_mount("web2", "/backup").unwrap();

        assert_eq!(store.failover_parent("web2").unwrap().as_deref(), Some("backup1"));
        assert_eq!(store.failover_parent("web1").unwrap(), None);
        assert_eq!(store.backup_mount_points("web2").unwrap(), vec![PathBuf::from("/backup")]);
        assert_eq!(store.server("backup1").unwrap().unwrap().address(), "backup1.example.net:4180");
    }
}
