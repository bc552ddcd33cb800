use crate::{BatchSink, FallbackSink, Health};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Progress events emitted by a recovery pass. Counters are cumulative for
/// the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    Started,
    InProgress { files: u64, samples: u64 },
    Completed { files: u64, samples: u64 },
    Cancelled { files: u64, samples: u64 },
    Failed { files: u64, samples: u64, error: String },
}

enum FileOutcome {
    Recovered(u64),
    HaltUnhealthy,
    Cancelled,
    Failed(crate::Error),
}

/// Replays pending fallback files into the primary sink in chronological
/// order, archiving each file only once every one of its samples has been
/// acknowledged. At most one pass runs at a time; duplicate starts are
/// no-ops.
pub struct RecoveryService<P: BatchSink> {
    primary: Arc<P>,
    fallback: Arc<FallbackSink>,
    health: watch::Receiver<Health>,
    batch_size: usize,
    archive_retention_days: u32,
    running: AtomicBool,
    events: broadcast::Sender<RecoveryEvent>,
    files_total: AtomicU64,
    samples_total: AtomicU64,
}

impl<P: BatchSink> RecoveryService<P> {
    pub fn new(
        primary: Arc<P>,
        fallback: Arc<FallbackSink>,
        health: watch::Receiver<Health>,
        batch_size: usize,
        archive_retention_days: u32,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            primary,
            fallback,
            health,
            batch_size: batch_size.max(1),
            archive_retention_days,
            running: AtomicBool::new(false),
            events,
            files_total: AtomicU64::new(0),
            samples_total: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Cumulative (files, samples) recovered over the service lifetime.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.files_total.load(Ordering::Relaxed),
            self.samples_total.load(Ordering::Relaxed),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Launches a recovery pass unless one is already running. Returns
    /// whether a pass was started.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("recovery pass already running; start is a no-op");
            return false;
        }
        let service = self.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            service.run_pass(cancel).await;
            service.running.store(false, Ordering::Release);
        });
        true
    }

    /// Runs one pass synchronously. Exposed for callers which want to await
    /// completion (tests, the `check` command); `start` is the production
    /// entry point.
    pub async fn run_pass(&self, cancel: CancellationToken) {
        let mut files = 0u64;
        let mut samples = 0u64;
        self.emit(RecoveryEvent::Started);
        tracing::info!("recovery pass started");

        let pending = match self.fallback.list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(?err, "failed to enumerate pending fallback files");
                self.emit(RecoveryEvent::Failed {
                    files,
                    samples,
                    error: err.to_string(),
                });
                return;
            }
        };

        for path in &pending {
            if cancel.is_cancelled() {
                self.emit(RecoveryEvent::Cancelled { files, samples });
                return;
            }
            match self.recover_file(path, &cancel).await {
                FileOutcome::Recovered(count) => {
                    files += 1;
                    samples += count;
                    self.files_total.fetch_add(1, Ordering::Relaxed);
                    self.samples_total.fetch_add(count, Ordering::Relaxed);
                    self.emit(RecoveryEvent::InProgress { files, samples });
                }
                FileOutcome::HaltUnhealthy => {
                    // The file stays pending and ordering is preserved; the
                    // next Healthy transition starts over from it.
                    tracing::warn!(path = %path.display(), "primary became unhealthy; halting recovery");
                    self.emit(RecoveryEvent::Cancelled { files, samples });
                    return;
                }
                FileOutcome::Cancelled => {
                    self.emit(RecoveryEvent::Cancelled { files, samples });
                    return;
                }
                FileOutcome::Failed(err) => {
                    // Skipping ahead would break inter-file ordering; leave
                    // this and all later files for the next pass.
                    tracing::warn!(?err, path = %path.display(), "recovery batch failed; pass will retry later");
                    self.emit(RecoveryEvent::Failed {
                        files,
                        samples,
                        error: err.to_string(),
                    });
                    return;
                }
            }
        }

        tracing::info!(files, samples, "recovery pass completed");
        self.emit(RecoveryEvent::Completed { files, samples });

        if let Err(err) = self.fallback.prune_archive(self.archive_retention_days).await {
            tracing::warn!(?err, "archive pruning failed");
        }
    }

    async fn recover_file(&self, path: &Path, cancel: &CancellationToken) -> FileOutcome {
        let samples = match self.fallback.read_file(path).await {
            Ok(samples) => samples,
            Err(err) => return FileOutcome::Failed(err),
        };

        if samples.is_empty() {
            // Nothing valid to recover; archive immediately so a corrupt
            // file cannot wedge every future pass.
            tracing::warn!(path = %path.display(), "fallback file has no valid records; archiving as-is");
            return match self.fallback.archive(path).await {
                Ok(_) => FileOutcome::Recovered(0),
                Err(err) => FileOutcome::Failed(err),
            };
        }

        for batch in samples.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return FileOutcome::Cancelled;
            }
            if *self.health.borrow() == Health::Unhealthy {
                return FileOutcome::HaltUnhealthy;
            }
            if let Err(err) = self.primary.write(batch).await {
                return FileOutcome::Failed(err);
            }
        }

        // Every batch derived from this file has been acknowledged.
        match self.fallback.archive(path).await {
            Ok(_) => FileOutcome::Recovered(samples.len() as u64),
            Err(err) => FileOutcome::Failed(err),
        }
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Error, Result};
    use std::sync::Mutex;
    use telemetry::{Sample, SampleValue};

    struct MockPrimary {
        written: Mutex<Vec<Vec<Sample>>>,
        // Batches to fail before succeeding, or a poisoned sink that always
        // fails.
        failures_left: Mutex<u32>,
        on_write: Option<Box<dyn Fn(usize) + Send + Sync>>,
    }

    impl MockPrimary {
        fn ok() -> Arc<Self> {
            Self::failing(0)
        }
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                failures_left: Mutex::new(failures),
                on_write: None,
            })
        }
        fn samples_written(&self) -> usize {
            self.written.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    #[async_trait::async_trait]
    impl BatchSink for MockPrimary {
        async fn write(&self, batch: &[Sample]) -> Result<()> {
            {
                let mut failures = self.failures_left.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::WriteTimeout(std::time::Duration::from_secs(5)));
                }
            }
            let mut written = self.written.lock().unwrap();
            written.push(batch.to_vec());
            if let Some(hook) = &self.on_write {
                hook(written.len());
            }
            Ok(())
        }
    }

    fn sample(seq: i64) -> Sample {
        Sample {
            server_id: "plc-1".to_string(),
            server_name: "PLC 1".to_string(),
            timestamp_utc: chrono::Utc::now(),
            node_id: "ns=2;s=Flow".to_string(),
            display_name: "Flow".to_string(),
            browse_path: "Plant/Flow".to_string(),
            data_type: "Int64".to_string(),
            value: SampleValue::Int(seq),
            status_code: 0,
            quality: "Good".to_string(),
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    async fn seed_file(sink: &FallbackSink, count: i64) {
        let batch: Vec<_> = (0..count).map(sample).collect();
        sink.write(&batch).await.unwrap();
    }

    fn healthy() -> watch::Receiver<Health> {
        let (tx, rx) = watch::channel(Health::Healthy);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn pass_replays_and_archives_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(FallbackSink::new(dir.path()).unwrap());
        std::fs::write(
            dir.path().join("data_20240101.jsonl"),
            format!("{}\n", serde_json::to_string(&sample(99)).unwrap()),
        )
        .unwrap();
        seed_file(&fallback, 5).await;

        let primary = MockPrimary::ok();
        let service = RecoveryService::new(primary.clone(), fallback.clone(), healthy(), 2, 0);
        let mut events = service.subscribe();
        service.run_pass(CancellationToken::new()).await;

        assert_eq!(primary.samples_written(), 6);
        // The older file's sample lands before today's.
        assert_eq!(primary.written.lock().unwrap()[0][0].value, SampleValue::Int(99));
        assert!(fallback.list_pending().await.unwrap().is_empty());
        assert_eq!(service.totals(), (2, 6));

        assert_eq!(events.recv().await.unwrap(), RecoveryEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            RecoveryEvent::InProgress { files: 1, samples: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RecoveryEvent::InProgress { files: 2, samples: 6 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RecoveryEvent::Completed { files: 2, samples: 6 }
        );
    }

    #[tokio::test]
    async fn failed_batch_leaves_file_pending_and_stops_pass() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(FallbackSink::new(dir.path()).unwrap());
        seed_file(&fallback, 4).await;

        let primary = MockPrimary::failing(1);
        let service = RecoveryService::new(primary.clone(), fallback.clone(), healthy(), 2, 0);
        service.run_pass(CancellationToken::new()).await;

        // First batch failed: nothing archived, file intact for the next pass.
        assert_eq!(primary.samples_written(), 0);
        assert_eq!(fallback.list_pending().await.unwrap().len(), 1);

        // The next pass re-reads from the start and succeeds.
        service.run_pass(CancellationToken::new()).await;
        assert_eq!(primary.samples_written(), 4);
        assert!(fallback.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unhealthy_mid_file_halts_without_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(FallbackSink::new(dir.path()).unwrap());
        seed_file(&fallback, 6).await;

        let (health_tx, health_rx) = watch::channel(Health::Healthy);
        let primary = Arc::new(MockPrimary {
            written: Mutex::new(Vec::new()),
            failures_left: Mutex::new(0),
            on_write: Some(Box::new(move |batches| {
                if batches == 1 {
                    health_tx.send_replace(Health::Unhealthy);
                }
            })),
        });

        let service = RecoveryService::new(primary.clone(), fallback.clone(), health_rx, 2, 0);
        let mut events = service.subscribe();
        service.run_pass(CancellationToken::new()).await;

        // One batch made it; the file is untouched pending a fresh pass.
        assert_eq!(primary.samples_written(), 2);
        assert_eq!(fallback.list_pending().await.unwrap().len(), 1);
        assert_eq!(events.recv().await.unwrap(), RecoveryEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            RecoveryEvent::Cancelled { files: 0, samples: 0 }
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_archived_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(FallbackSink::new(dir.path()).unwrap());
        std::fs::write(dir.path().join("data_20240101.jsonl"), "not json\nstill not\n").unwrap();

        let primary = MockPrimary::ok();
        let service = RecoveryService::new(primary.clone(), fallback.clone(), healthy(), 2, 0);
        service.run_pass(CancellationToken::new()).await;

        assert_eq!(primary.samples_written(), 0);
        assert!(fallback.list_pending().await.unwrap().is_empty());
        assert_eq!(service.totals(), (1, 0));
    }

    #[tokio::test]
    async fn duplicate_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Arc::new(FallbackSink::new(dir.path()).unwrap());
        let primary = MockPrimary::ok();
        let service = RecoveryService::new(primary, fallback, healthy(), 2, 0);

        let cancel = CancellationToken::new();
        service.running.store(true, Ordering::Release);
        assert!(!service.start(&cancel));
        service.running.store(false, Ordering::Release);
        assert!(service.start(&cancel));
    }
}
