//! Periodic replication passes for the targets this server is the source of.
//!
//! A pass walks the enabled targets one at a time. Each run executes on its
//! own task so that an error or panic is contained, recorded in the
//! replication log and followed by the next target. Shutdown is the only
//! error that ends a pass early.

pub mod due;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use failover_store::{Inventory, ReplicationLog, ReplicationRun, ReplicationTarget};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::daemon::Watchdog;
use crate::sync::SendStats;
use crate::transfer::stats::RunSummary;
use crate::transfer::TrafficCounters;
use crate::utils::blocking;
use crate::utils::errors::{AgentError, Result};

pub use due::{is_due, DueReason};
pub use runner::{ReplicationRunner, TargetRunner};

/// Pending manual triggers beyond this are refused.
const TRIGGER_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Name of this server in the inventory.
    pub server_name: String,
    /// Delay before the first pass.
    pub startup_interval: Duration,
    pub tick_interval: Duration,
}

/// The most recent attempt for a target, as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// False when the replication log could not be written.
    pub logged: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub ran: usize,
    pub failed: usize,
    /// Destination is this server's failover parent.
    pub skipped: usize,
    pub not_due: usize,
}

/// Queues forced runs onto a started scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    triggers: mpsc::Sender<String>,
}

impl SchedulerHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(triggers: mpsc::Sender<String>) -> Self {
        Self { triggers }
    }

    pub fn trigger(&self, target_id: &str) -> Result<()> {
        self.triggers.try_send(target_id.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AgentError::Daemon("too many pending triggers".into()),
            mpsc::error::TrySendError::Closed(_) => AgentError::Shutdown,
        })
    }
}

pub struct Scheduler<R: TargetRunner> {
    settings: SchedulerSettings,
    inventory: Arc<dyn Inventory>,
    log: Arc<dyn ReplicationLog>,
    runner: Arc<R>,
    watchdog: Watchdog,
    outcomes: Mutex<HashMap<String, AttemptOutcome>>,
    trigger_tx: mpsc::Sender<String>,
    trigger_rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
}

impl<R: TargetRunner> Scheduler<R> {
    /// `shutdown` is the daemon-wide token; [`Scheduler::stop`] only cancels a child of it.
    pub fn new(
        settings: SchedulerSettings,
        inventory: Arc<dyn Inventory>,
        log: Arc<dyn ReplicationLog>,
        runner: Arc<R>,
        watchdog: Watchdog,
        shutdown: &CancellationToken,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        Self {
            settings,
            inventory,
            log,
            runner,
            watchdog,
            outcomes: Mutex::new(HashMap::new()),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            shutdown: shutdown.child_token(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            triggers: self.trigger_tx.clone(),
        }
    }

    /// Spawn the tick loop. A scheduler can only be started once.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut triggers = self
            .trigger_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::Daemon("scheduler already started".into()))?;
        let scheduler = self.clone();

        Ok(tokio::spawn(async move {
            tracing::info!(
                server = %scheduler.settings.server_name,
                startup_secs = scheduler.settings.startup_interval.as_secs(),
                tick_secs = scheduler.settings.tick_interval.as_secs(),
                "Scheduler started"
            );
            let tick = tokio::time::sleep(scheduler.settings.startup_interval);
            tokio::pin!(tick);

            loop {
                let result = tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = &mut tick => {
                        tick.as_mut().reset(tokio::time::Instant::now() + scheduler.settings.tick_interval);
                        scheduler.run_pass().await.map(|report| {
                            tracing::info!(
                                ran = report.ran,
                                failed = report.failed,
                                skipped = report.skipped,
                                not_due = report.not_due,
                                "Replication pass finished"
                            );
                        })
                    }
                    Some(target_id) = triggers.recv() => scheduler.run_forced(&target_id).await,
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => break,
                    Err(e) => tracing::warn!(error = %e, "Scheduler iteration failed"),
                }
            }
            tracing::info!("Scheduler stopped");
        }))
    }

    /// Stop the loop and abort any in-flight run.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn last_outcome(&self, target_id: &str) -> Option<AttemptOutcome> {
        self.outcomes.lock().await.get(target_id).cloned()
    }

    /// Run every due target once, in inventory order.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let inventory = self.inventory.clone();
        let name = self.settings.server_name.clone();
        let (targets, parent) = blocking(move || {
            let targets = inventory.targets_for_source(&name)?;
            let parent = inventory.failover_parent(&name)?;
            Ok((targets, parent))
        })
        .await?;

        let mut report = PassReport::default();
        for target in targets {
            if self.shutdown.is_cancelled() {
                return Err(AgentError::Shutdown);
            }
            if parent.as_deref() == Some(target.destination.as_str()) {
                tracing::debug!(target_id = %target.id, destination = %target.destination, "Skipping target: destination is our failover parent");
                report.skipped += 1;
                continue;
            }

            let reason = match self.due_reason(&target).await {
                Ok(Some(reason)) => reason,
                Ok(None) => {
                    report.not_due += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(target_id = %target.id, error = %e, "Could not read replication history");
                    report.failed += 1;
                    continue;
                }
            };

            report.ran += 1;
            match self.execute(&target, reason).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Run one target now, whatever its schedule says.
    pub async fn run_forced(&self, target_id: &str) -> Result<()> {
        let inventory = self.inventory.clone();
        let id = target_id.to_string();
        let name = self.settings.server_name.clone();
        let (target, parent) = blocking(move || {
            let target = inventory.target(&id)?;
            let parent = inventory.failover_parent(&name)?;
            Ok((target, parent))
        })
        .await?;

        let target = target.ok_or_else(|| AgentError::Validation(format!("unknown target {}", target_id)))?;
        if !target.enabled {
            return Err(AgentError::Validation(format!("target {} is disabled", target_id)));
        }
        if target.source != self.settings.server_name {
            return Err(AgentError::Validation(format!(
                "target {} replicates from {}, not from this server",
                target_id, target.source
            )));
        }
        if parent.as_deref() == Some(target.destination.as_str()) {
            return Err(AgentError::Validation(format!(
                "destination {} is this server's failover parent",
                target.destination
            )));
        }
        self.execute(&target, DueReason::Forced).await
    }

    async fn due_reason(&self, target: &ReplicationTarget) -> Result<Option<DueReason>> {
        if let Some(outcome) = self.last_outcome(&target.id).await {
            if !outcome.success {
                return Ok(Some(DueReason::LastFailed));
            }
        }
        let log = self.log.clone();
        let id = target.id.clone();
        let last = blocking(move || Ok(log.last_run(&id)?)).await?;
        Ok(is_due(target, last.as_ref(), &Local::now()))
    }

    /// Run, record and report one attempt. Returns the run's own error.
    async fn execute(&self, target: &ReplicationTarget, reason: DueReason) -> Result<()> {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let counters = TrafficCounters::new();
        let _watchdog = self.watchdog.start(format!("target {}", target.id));
        tracing::info!(
            target_id = %target.id,
            destination = %target.destination,
            reason = %reason,
            "Starting replication run"
        );

        let mut task = {
            let runner = self.runner.clone();
            let target = target.clone();
            let counters = counters.clone();
            tokio::spawn(async move { runner.run(&target, &counters).await })
        };
        let outcome: Result<SendStats> = tokio::select! {
            joined = &mut task => joined.map_err(AgentError::from).and_then(|result| result),
            _ = self.shutdown.cancelled() => {
                task.abort();
                let _ = task.await;
                Err(AgentError::Shutdown)
            }
        };

        let mut run = ReplicationRun::new(&target.id, started_at);
        run.finished_at = Utc::now();
        run.bytes = counters.total();
        match &outcome {
            Ok(stats) => {
                run.success = true;
                run.scanned = stats.scanned;
                run.updated = stats.updated;
                let summary = RunSummary {
                    stats: *stats,
                    wire_bytes: run.bytes,
                    elapsed: clock.elapsed(),
                };
                tracing::info!(target_id = %target.id, "Replication run succeeded: {}", summary);
            }
            Err(e) => {
                run.error = Some(e.to_string());
                tracing::error!(target_id = %target.id, error = %e, "Replication run failed");
            }
        }

        let log = self.log.clone();
        let record = run.clone();
        let logged = match blocking(move || Ok(log.append(&record)?)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(target_id = %target.id, error = %e, "Failed to record replication run");
                false
            }
        };
        self.outcomes.lock().await.insert(
            target.id.clone(),
            AttemptOutcome {
                finished_at: run.finished_at,
                success: run.success,
                logged,
            },
        );

        outcome.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_store;
    use failover_store::{CreateTargetRequest, Server, SqliteStore};
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeRunner {
        calls: std::sync::Mutex<Vec<String>>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        hang: bool,
    }

    impl FakeRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TargetRunner for FakeRunner {
        async fn run(&self, target: &ReplicationTarget, _counters: &TrafficCounters) -> Result<SendStats> {
            self.calls.lock().unwrap().push(target.id.clone());
            if self.panicking.contains(&target.id) {
                panic!("runner blew up");
            }
            if self.failing.contains(&target.id) {
                return Err(AgentError::Remote("disk full".into()));
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(SendStats {
                batches: 1,
                scanned: 3,
                updated: 1,
                content_bytes: 10,
            })
        }
    }

    fn extra_target(store: &SqliteStore) -> ReplicationTarget {
        store
            .create_target(&CreateTargetRequest {
                source: "primary".into(),
                destination: "standby".into(),
                to_path: "/srv/mirror".into(),
                schedule_hours: Default::default(),
                min_interval_secs: 3600,
                bandwidth_limit: -1,
                use_compression: false,
            })
            .unwrap()
    }

    fn scheduler(store: &Arc<SqliteStore>, runner: FakeRunner, shutdown: &CancellationToken) -> Arc<Scheduler<FakeRunner>> {
        let settings = SchedulerSettings {
            server_name: "primary".into(),
            startup_interval: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(3600),
        };
        Arc::new(Scheduler::new(
            settings,
            store.clone(),
            store.clone(),
            Arc::new(runner),
            Watchdog::new(Duration::from_secs(3600)),
            shutdown,
        ))
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_the_pass() {
        let (_dir, store, ok) = seeded_store();
        let failing = extra_target(&store);
        let panicking = extra_target(&store);
        let store = Arc::new(store);
        let runner = FakeRunner {
            failing: HashSet::from([failing.id.clone()]),
            panicking: HashSet::from([panicking.id.clone()]),
            ..Default::default()
        };
        let scheduler = scheduler(&store, runner, &CancellationToken::new());

        let report = scheduler.run_pass().await.unwrap();
        assert_eq!(report.ran, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(scheduler.runner.calls().len(), 3);

        let good = store.last_run(&ok.id).unwrap().unwrap();
        assert!(good.success);
        assert_eq!(good.scanned, 3);
        let bad = store.last_run(&failing.id).unwrap().unwrap();
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("disk full"));
        assert!(!store.last_run(&panicking.id).unwrap().unwrap().success);
        assert!(!scheduler.last_outcome(&panicking.id).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_success_is_not_repeated_but_failure_is() {
        let (_dir, store, ok) = seeded_store();
        let failing = extra_target(&store);
        let store = Arc::new(store);
        let runner = FakeRunner {
            failing: HashSet::from([failing.id.clone()]),
            ..Default::default()
        };
        let scheduler = scheduler(&store, runner, &CancellationToken::new());

        scheduler.run_pass().await.unwrap();
        let second = scheduler.run_pass().await.unwrap();
        assert_eq!(second.ran, 1);
        assert_eq!(second.not_due, 1);

        let calls = scheduler.runner.calls();
        assert_eq!(calls.iter().filter(|id| **id == ok.id).count(), 1);
        assert_eq!(calls.iter().filter(|id| **id == failing.id).count(), 2);
    }

    #[tokio::test]
    async fn test_failover_parent_destination_is_skipped() {
        let (_dir, store, target) = seeded_store();
        let mut primary = store.server("primary").unwrap().unwrap();
        primary.failover_parent = Some("standby".into());
        store.upsert_server(&primary).unwrap();
        let store = Arc::new(store);
        let scheduler = scheduler(&store, FakeRunner::default(), &CancellationToken::new());

        let report = scheduler.run_pass().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(scheduler.runner.calls().is_empty());

        let forced = scheduler.run_forced(&target.id).await;
        assert!(matches!(forced, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_forced_run_ignores_schedule() {
        let (_dir, store, target) = seeded_store();
        let store = Arc::new(store);
        let scheduler = scheduler(&store, FakeRunner::default(), &CancellationToken::new());

        scheduler.run_pass().await.unwrap();
        scheduler.run_forced(&target.id).await.unwrap();
        assert_eq!(scheduler.runner.calls().len(), 2);
        assert_eq!(store.recent_runs(&target.id, 10).unwrap().len(), 2);

        let unknown = scheduler.run_forced("missing").await;
        assert!(matches!(unknown, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_forced_run_refuses_foreign_source() {
        let (_dir, store, _target) = seeded_store();
        store
            .upsert_server(&Server {
                name: "other".into(),
                hostname: "127.0.0.1".into(),
                port: 1,
                zone: "eu".into(),
                failover_parent: None,
            })
            .unwrap();
        let foreign = store
            .create_target(&CreateTargetRequest {
                source: "other".into(),
                destination: "standby".into(),
                to_path: "/srv/other".into(),
                schedule_hours: Default::default(),
                min_interval_secs: 3600,
                bandwidth_limit: -1,
                use_compression: false,
            })
            .unwrap();
        let store = Arc::new(store);
        let scheduler = scheduler(&store, FakeRunner::default(), &CancellationToken::new());

        let result = scheduler.run_forced(&foreign.id).await;
        assert!(matches!(result, Err(AgentError::Validation(_))));
        assert!(scheduler.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_and_records_failed_run() {
        let (_dir, store, target) = seeded_store();
        let store = Arc::new(store);
        let runner = FakeRunner {
            hang: true,
            ..Default::default()
        };
        let scheduler = scheduler(&store, runner, &CancellationToken::new());

        let pass = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_pass().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();

        let result = pass.await.unwrap();
        assert!(matches!(result, Err(AgentError::Shutdown)));
        let run = store.last_run(&target.id).unwrap().unwrap();
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("Shutdown in progress"));
    }

    #[tokio::test]
    async fn test_started_scheduler_serves_triggers_until_stopped() {
        let (_dir, store, target) = seeded_store();
        let store = Arc::new(store);
        let daemon = CancellationToken::new();
        let scheduler = scheduler(&store, FakeRunner::default(), &daemon);

        let join = scheduler.start().await.unwrap();
        assert!(scheduler.start().await.is_err());
        scheduler.handle().trigger(&target.id).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.last_outcome(&target.id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(scheduler.last_outcome(&target.id).await.unwrap().logged);

        daemon.cancel();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
        assert_eq!(scheduler.runner.calls().len(), 1);
        assert!(matches!(scheduler.handle().trigger(&target.id), Err(AgentError::Shutdown)));
    }
}
