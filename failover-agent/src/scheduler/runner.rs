//! Source side of one replication run: resolve, connect, negotiate, send.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use failover_store::{Inventory, ReplicationTarget, Server};
use tracing::{debug, info};

use crate::fs::{walk_batches, ExclusionRegistry};
use crate::sync::{send_tree, SendStats};
use crate::transfer::{should_compress, CodecStage, Layer, LayerStack, TrafficCounters};
use crate::transport::{client_handshake, ConnectionPool};
use crate::utils::errors::{AgentError, Result};

/// Executes a single run for a target. Wire traffic is reported through `counters`
/// so the caller can log bytes even for runs that fail halfway.
pub trait TargetRunner: Send + Sync + 'static {
    fn run(
        &self,
        target: &ReplicationTarget,
        counters: &TrafficCounters,
    ) -> impl Future<Output = Result<SendStats>> + Send;
}

pub struct ReplicationRunner {
    pub inventory: Arc<dyn Inventory>,
    pub pool: Arc<ConnectionPool>,
    /// Base no-copy list, as wire prefixes.
    pub exclusions: ExclusionRegistry,
    pub root: PathBuf,
    pub batch_size: usize,
    pub data_dir: PathBuf,
    pub codec: Arc<dyn CodecStage>,
}

struct RunPlan {
    destination: Server,
    token: String,
    compress: bool,
    exclusions: Arc<ExclusionRegistry>,
}

impl ReplicationRunner {
    async fn plan(&self, target: &ReplicationTarget) -> Result<RunPlan> {
        let inventory = self.inventory.clone();
        let target = target.clone();
        let base = self.exclusions.clone();
        let root = self.root.clone();
        let data_dir = self.data_dir.clone();

        tokio::task::spawn_blocking(move || {
            let destination = inventory.server(&target.destination)?.ok_or_else(|| {
                AgentError::Config(format!("destination server {} is not in the inventory", target.destination))
            })?;
            let source = inventory.server(&target.source)?.ok_or_else(|| {
                AgentError::Config(format!("source server {} is not in the inventory", target.source))
            })?;
            let mounts = inventory.backup_mount_points(&source.name)?;
            let token = inventory.issue_token(&target.id)?;

            let exclusions = base
                .with_local_paths(&root, [&data_dir])
                .with_local_paths(&root, &mounts);
            Ok(RunPlan {
                compress: should_compress(target.use_compression, &source.zone, &destination.zone),
                destination,
                token,
                exclusions: Arc::new(exclusions),
            })
        })
        .await?
    }
}

impl TargetRunner for ReplicationRunner {
    async fn run(&self, target: &ReplicationTarget, counters: &TrafficCounters) -> Result<SendStats> {
        let plan = self.plan(target).await?;
        debug!(
            target_id = %target.id,
            destination = %plan.destination.name,
            exclusions = plan.exclusions.prefix_count(),
            compress = plan.compress,
            "Run planned"
        );
        let batches = walk_batches(&self.root, plan.exclusions.clone(), self.batch_size)?;

        let mut connection = self
            .pool
            .acquire(&plan.destination.name, &plan.destination.address())
            .await?;
        let reused = connection.was_reused();

        let (stats, compressed) = {
            let stream = connection.stream_mut()?;
            let (read, write) = stream.split();
            let mut layers = LayerStack::new(read, write).push(Layer::Counting(counters.clone()))?;
            if let Some(cap) = target.bandwidth_cap() {
                layers = layers.push(Layer::Throttle(cap))?;
            }

            {
                let (reader, writer) = layers.halves();
                client_handshake(reader, writer, &plan.token, plan.compress).await?;
            }
            if plan.compress {
                layers = layers.push(Layer::Compression(self.codec.clone()))?;
            }
            info!(
                target_id = %target.id,
                destination = %plan.destination.name,
                reused,
                layers = ?layers.layers(),
                "Replication session open"
            );

            let stats = {
                let (reader, writer) = layers.halves();
                send_tree(reader, writer, batches).await?
            };
            let compressed = layers.is_compressed();
            layers.close().await?;
            (stats, compressed)
        };

        if !compressed {
            connection.release();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{point_at, seeded_store};
    use crate::transfer::ZstdStage;
    use crate::transport::{serve, ReceiverContext};
    use failover_store::CreateTargetRequest;
    use std::fs;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _dir: tempfile::TempDir,
        runner: ReplicationRunner,
        store: Arc<failover_store::SqliteStore>,
        target: ReplicationTarget,
        source_root: PathBuf,
        shutdown: CancellationToken,
    }

    async fn harness() -> Harness {
        let (dir, store, target) = seeded_store();
        let source_root = dir.path().join("source");
        fs::create_dir_all(source_root.join("etc")).unwrap();
        fs::write(source_root.join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        fs::write(source_root.join("motd"), b"welcome\n").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        point_at(&store, "standby", listener.local_addr().unwrap());
        let store = Arc::new(store);
        let codec: Arc<dyn CodecStage> = Arc::new(ZstdStage::default());

        let context = Arc::new(ReceiverContext {
            inventory: store.clone(),
            codec: codec.clone(),
            exclusions: ExclusionRegistry::empty(),
            data_dir: dir.path().join("standby-state"),
            verify_content: false,
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, context, shutdown.clone()));

        let runner = ReplicationRunner {
            inventory: store.clone(),
            pool: Arc::new(ConnectionPool::new(2)),
            exclusions: ExclusionRegistry::empty(),
            root: source_root.clone(),
            batch_size: 2,
            data_dir: dir.path().join("primary-state"),
            codec,
        };
        Harness {
            _dir: dir,
            runner,
            store,
            target,
            source_root,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_run_over_loopback_mirrors_and_reuses_connection() {
        let h = harness().await;
        let counters = TrafficCounters::new();

        let first = h.runner.run(&h.target, &counters).await.unwrap();
        assert_eq!(first.scanned, 4);
        assert_eq!(first.content_bytes, 28);
        assert!(counters.total() > 0);
        assert_eq!(
            fs::read(h.target.to_path.join("etc/hosts")).unwrap(),
            b"127.0.0.1 localhost\n"
        );
        assert_eq!(h.runner.pool.idle_count("standby"), 1);

        fs::remove_file(h.source_root.join("motd")).unwrap();
        let second = h.runner.run(&h.target, &TrafficCounters::new()).await.unwrap();
        assert_eq!(second.content_bytes, 0);
        assert!(!h.target.to_path.join("motd").exists());
        assert_eq!(h.runner.pool.idle_count("standby"), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_compressed_run_is_not_pooled() {
        let h = harness().await;
        let compressed = h
            .store
            .create_target(&CreateTargetRequest {
                source: "primary".into(),
                destination: "standby".into(),
                to_path: h.target.to_path.clone(),
                schedule_hours: Default::default(),
                min_interval_secs: 3600,
                bandwidth_limit: -1,
                use_compression: true,
            })
            .unwrap();

        let stats = h.runner.run(&compressed, &TrafficCounters::new()).await.unwrap();
        assert_eq!(stats.scanned, 4);
        assert_eq!(fs::read(compressed.to_path.join("motd")).unwrap(), b"welcome\n");
        assert_eq!(h.runner.pool.idle_count("standby"), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bandwidth_cap_paces_content() {
        let h = harness().await;
        fs::write(h.source_root.join("blob"), vec![0x5a; 200_000]).unwrap();
        let capped = h
            .store
            .create_target(&CreateTargetRequest {
                source: "primary".into(),
                destination: "standby".into(),
                to_path: h.target.to_path.clone(),
                schedule_hours: Default::default(),
                min_interval_secs: 3600,
                bandwidth_limit: 100_000,
                use_compression: false,
            })
            .unwrap();

        let started = std::time::Instant::now();
        let stats = h.runner.run(&capped, &TrafficCounters::new()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(stats.content_bytes, 200_028);
        assert!(elapsed >= Duration::from_millis(1_500), "200 kB at 100 kB/s took {:?}", elapsed);
        assert_eq!(fs::read(capped.to_path.join("blob")).unwrap().len(), 200_000);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_destination_fails_before_connecting() {
        let h = harness().await;
        let mut target = h.target.clone();
        target.destination = "nowhere".into();
        let result = h.runner.run(&target, &TrafficCounters::new()).await;
        assert!(matches!(result, Err(AgentError::Config(_))));
        h.shutdown.cancel();
    }
}
