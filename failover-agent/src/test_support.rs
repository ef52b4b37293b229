//! Fixtures shared by unit tests.

use std::net::SocketAddr;

use failover_store::{CreateTargetRequest, Inventory, ReplicationTarget, Server, SqliteStore};
use tempfile::TempDir;

fn server(name: &str, zone: &str) -> Server {
    Server {
        name: name.into(),
        hostname: "127.0.0.1".into(),
        port: 7420,
        zone: zone.into(),
        failover_parent: None,
    }
}

/// A store with `primary` (zone eu) replicating uncompressed to `standby` (zone us).
/// The target's destination root is `<tempdir>/mirror`.
pub(crate) fn seeded_store() -> (TempDir, SqliteStore, ReplicationTarget) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("inventory.db"), 2).unwrap();
    store.upsert_server(&server("primary", "eu")).unwrap();
    store.upsert_server(&server("standby", "us")).unwrap();
    let target = store
        .create_target(&CreateTargetRequest {
            source: "primary".into(),
            destination: "standby".into(),
            to_path: dir.path().join("mirror"),
            schedule_hours: Default::default(),
            min_interval_secs: 3600,
            bandwidth_limit: -1,
            use_compression: false,
        })
        .unwrap();
    (dir, store, target)
}

/// Repoint a server record at a listener started by the test.
pub(crate) fn point_at(store: &SqliteStore, name: &str, addr: SocketAddr) {
    let mut record = store.server(name).unwrap().unwrap();
    record.hostname = addr.ip().to_string();
    record.port = addr.port();
    store.upsert_server(&record).unwrap();
}
