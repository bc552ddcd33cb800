use acquisition::{ConnectSummary, ConnectionState, ServerManager, ServerRuntime, SessionDefaults, StateChange};
use anyhow::Context;
use ingress::SampleQueue;
use persistence::{
    CircuitBreaker, CircuitState, Coordinator, FallbackSink, Health, HealthMonitor, MongoProbe,
    MongoSink, PersistenceMode, RecoveryEvent, RecoveryService,
};
use std::sync::{Arc, Mutex};
use telemetry::{AgentConfig, ServerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Aggregated runtime state returned by `snapshot`. A copy: the supervisor
/// never hands out references into live component state.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub aggregate_state: ConnectionState,
    pub servers: Vec<ServerRuntime>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub enqueued_total: u64,
    pub dropped_total: u64,
    pub mode: PersistenceMode,
    pub health: Health,
    pub circuit: CircuitState,
    pub persisted_total: u64,
    pub primary_written_total: u64,
    pub fallback_written_total: u64,
    pub lost_total: u64,
    pub pending_files: usize,
    pub recovered_files_total: u64,
    pub recovered_samples_total: u64,
    pub samples_per_second: f64,
}

struct RateWindow {
    at: std::time::Instant,
    persisted: u64,
}

impl RateWindow {
    fn sample(&mut self, persisted: u64) -> f64 {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.at).as_secs_f64();
        let delta = persisted.saturating_sub(self.persisted);
        self.at = now;
        self.persisted = persisted;
        if elapsed <= f64::EPSILON {
            0.0
        } else {
            delta as f64 / elapsed
        }
    }
}

/// Wires every component together and owns their lifetimes. Health events
/// drive the coordinator's sink selection; a recovery pass is started
/// whenever the primary becomes healthy while it is the selected sink.
pub struct Supervisor {
    config: AgentConfig,
    queue: Arc<SampleQueue>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor<MongoProbe>>,
    fallback: Arc<FallbackSink>,
    recovery: Arc<RecoveryService<MongoSink>>,
    coordinator: Arc<Coordinator<MongoSink, FallbackSink>>,
    manager: Arc<ServerManager>,
    health_cancel: CancellationToken,
    recovery_cancel: CancellationToken,
    coordinator_cancel: CancellationToken,
    manager_cancel: CancellationToken,
    coordinator_task: Mutex<Option<JoinHandle<()>>>,
    aux_tasks: Mutex<Vec<JoinHandle<()>>>,
    rate: Mutex<RateWindow>,
}

impl Supervisor {
    /// Builds and starts the agent: persistence first, then the health
    /// observation loop, then the server connect fan-out.
    pub async fn start(config: AgentConfig) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid configuration snapshot")?;

        let queue = Arc::new(SampleQueue::new(config.queue_capacity));

        let mut options = mongodb::options::ClientOptions::parse(&config.mongo_uri)
            .await
            .context("failed to parse the primary connection string")?;
        options.app_name = Some("fieldgate".to_string());
        options.server_selection_timeout = Some(config.write_timeout());
        let client = mongodb::Client::with_options(options)
            .context("failed to build the primary store client")?;
        let collection = client
            .database(&config.mongo_database)
            .collection::<mongodb::bson::Document>(&config.mongo_collection);

        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_cooldown(),
        ));
        let primary = MongoSink::new(
            collection,
            breaker.clone(),
            config.write_timeout(),
            config.ttl_days,
        );
        let fallback = Arc::new(
            FallbackSink::new(config.fallback_dir())
                .context("failed to prepare the fallback directory")?,
        );

        let probe = MongoProbe::connect(
            &config.mongo_uri,
            &config.mongo_database,
            config.health_probe_timeout(),
        )
        .await
        .context("failed to build the health probe client")?;
        let health = Arc::new(HealthMonitor::new(
            probe,
            config.health_interval(),
            config.health_probe_timeout(),
            config.health_failure_threshold,
            config.degraded_latency(),
        ));

        let recovery = RecoveryService::new(
            primary.clone(),
            fallback.clone(),
            health.watch(),
            config.batch_size,
            config.archive_retention_days,
        );
        let coordinator = Coordinator::new(
            queue.clone(),
            primary,
            fallback.clone(),
            config.batch_size,
            config.batch_timeout(),
            config.force_fallback,
            config.dry_run,
        );

        let health_cancel = CancellationToken::new();
        let recovery_cancel = CancellationToken::new();
        let coordinator_cancel = CancellationToken::new();
        let manager_cancel = CancellationToken::new();

        let manager = Arc::new(ServerManager::new(
            queue.clone(),
            SessionDefaults {
                session_timeout_ms: config.session_timeout_ms,
                keepalive_interval_ms: config.keepalive_interval_ms,
            },
            manager_cancel.clone(),
        ));

        let mut aux_tasks = Vec::new();
        aux_tasks.push(tokio::spawn({
            let health = health.clone();
            let cancel = health_cancel.clone();
            async move { health.run(cancel).await }
        }));
        aux_tasks.push(tokio::spawn(observe_health(
            health.clone(),
            coordinator.clone(),
            recovery.clone(),
            recovery_cancel.clone(),
            health_cancel.clone(),
        )));
        let coordinator_task = tokio::spawn({
            let coordinator = coordinator.clone();
            let cancel = coordinator_cancel.clone();
            async move { coordinator.run(cancel).await }
        });

        let supervisor = Arc::new(Self {
            queue,
            breaker,
            health,
            fallback,
            recovery,
            coordinator,
            manager,
            health_cancel,
            recovery_cancel,
            coordinator_cancel,
            manager_cancel,
            coordinator_task: Mutex::new(Some(coordinator_task)),
            aux_tasks: Mutex::new(aux_tasks),
            rate: Mutex::new(RateWindow {
                at: std::time::Instant::now(),
                persisted: 0,
            }),
            config,
        });

        let summary = supervisor
            .manager
            .connect_all(&supervisor.config.servers)
            .await;
        tracing::info!(
            connected = summary.connected,
            failed = summary.failed,
            "fieldgate started"
        );
        Ok(supervisor)
    }

    /// Ordered shutdown: cancel health, recovery, coordinator, and the
    /// sessions; tear acquisition down; close the queue; await the
    /// coordinator's drain.
    pub async fn stop(&self) {
        tracing::info!("fieldgate stopping");
        self.health_cancel.cancel();
        self.recovery_cancel.cancel();
        self.coordinator_cancel.cancel();
        self.manager_cancel.cancel();

        self.manager.shutdown().await;
        self.queue.close();

        let task = self.coordinator_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let aux = std::mem::take(&mut *self.aux_tasks.lock().unwrap());
        for task in aux {
            let _ = task.await;
        }
        tracing::info!("fieldgate stopped");
    }

    /// Sets or clears the operator mode override. Returning to Primary
    /// triggers a recovery pass, exactly as a health recovery would.
    pub fn force_mode(&self, mode: Option<PersistenceMode>) {
        if let Some((_, PersistenceMode::Primary)) = self.coordinator.force_mode(mode) {
            self.recovery.start(&self.recovery_cancel);
        }
    }

    /// Applies a fresh configuration snapshot's server list to the running
    /// session set.
    pub async fn apply_servers(&self, servers: &[ServerConfig]) -> ConnectSummary {
        self.manager.apply(servers).await
    }

    pub fn subscribe_server_events(&self) -> tokio::sync::broadcast::Receiver<StateChange> {
        self.manager.subscribe()
    }

    pub fn subscribe_mode_events(&self) -> tokio::sync::broadcast::Receiver<PersistenceMode> {
        self.coordinator.subscribe_mode()
    }

    pub fn subscribe_recovery_events(&self) -> tokio::sync::broadcast::Receiver<RecoveryEvent> {
        self.recovery.subscribe()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let stats = self.coordinator.stats();
        let pending_files = self
            .fallback
            .list_pending()
            .await
            .map(|pending| pending.len())
            .unwrap_or(0);
        let (recovered_files_total, recovered_samples_total) = self.recovery.totals();
        let samples_per_second = self.rate.lock().unwrap().sample(stats.persisted);

        StatusSnapshot {
            aggregate_state: self.manager.aggregate_state(),
            servers: self.manager.runtimes(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            enqueued_total: self.queue.enqueued(),
            dropped_total: self.queue.dropped(),
            mode: self.coordinator.mode(),
            health: self.health.current(),
            circuit: self.breaker.state(),
            persisted_total: stats.persisted,
            primary_written_total: stats.primary_written,
            fallback_written_total: stats.fallback_written,
            lost_total: stats.lost,
            pending_files,
            recovered_files_total,
            recovered_samples_total,
            samples_per_second,
        }
    }
}

/// Routes health events into coordinator mode selection, and starts a
/// recovery pass whenever the store is healthy and Primary is the effective
/// sink (covering both the Fallback→Primary transition and startup with
/// files left over from a previous run).
async fn observe_health(
    health: Arc<HealthMonitor<MongoProbe>>,
    coordinator: Arc<Coordinator<MongoSink, FallbackSink>>,
    recovery: Arc<RecoveryService<MongoSink>>,
    recovery_cancel: CancellationToken,
    cancel: CancellationToken,
) {
    let mut events = health.subscribe();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(health) => {
                coordinator.handle_health(health);
                if health == Health::Healthy && coordinator.mode() == PersistenceMode::Primary {
                    recovery.start(&recovery_cancel);
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "health event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(dir: &std::path::Path) -> AgentConfig {
        serde_json::from_value(serde_json::json!({
            "mongoUri": "mongodb://localhost:27017",
            "mongoDatabase": "fieldgate",
            "mongoCollection": "datapoints",
            "dryRun": true,
            "fallbackDir": dir,
            "healthIntervalSecs": 3600,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn starts_snapshots_and_stops_without_a_live_store() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::start(config(dir.path())).await.unwrap();

        let snapshot = supervisor.snapshot().await;
        assert_eq!(snapshot.mode, PersistenceMode::DryRun);
        assert_eq!(snapshot.aggregate_state, ConnectionState::Disconnected);
        assert_eq!(snapshot.queue_capacity, 10_000);
        assert_eq!(snapshot.pending_files, 0);
        assert!(snapshot.servers.is_empty());

        supervisor.stop().await;
        assert_eq!(supervisor.snapshot().await.mode, PersistenceMode::Stopped);
    }

    #[tokio::test]
    async fn force_mode_round_trips_through_the_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = config(dir.path());
        raw.dry_run = false;
        let supervisor = Supervisor::start(raw).await.unwrap();

        supervisor.force_mode(Some(PersistenceMode::Fallback));
        assert_eq!(supervisor.snapshot().await.mode, PersistenceMode::Fallback);
        supervisor.force_mode(None);
        assert_eq!(supervisor.snapshot().await.mode, PersistenceMode::Primary);

        supervisor.stop().await;
    }
}
