use crate::{BatchSink, Health};
use ingress::SampleQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry::Sample;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Which sink the coordinator consults for the batches it assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PersistenceMode {
    Primary,
    Fallback,
    /// Discard batches after counting them; never invoke a sink. Reserved
    /// for connectivity testing.
    DryRun,
    Stopped,
}

/// Counter snapshot for status reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CoordinatorStats {
    /// Samples that left the coordinator without loss (primary, fallback,
    /// or counted under dry-run).
    pub persisted: u64,
    pub primary_written: u64,
    pub fallback_written: u64,
    /// Samples lost because the fallback sink also failed. The only
    /// sanctioned loss path, and it must stay observable.
    pub lost: u64,
    pub batches: u64,
}

struct ModeState {
    /// Health-driven selection: Primary or Fallback.
    health_mode: PersistenceMode,
    /// Operator override: Fallback or DryRun. Takes precedence.
    forced: Option<PersistenceMode>,
    stopped: bool,
}

impl ModeState {
    fn effective_live(&self) -> PersistenceMode {
        self.forced.unwrap_or(self.health_mode)
    }
    fn effective(&self) -> PersistenceMode {
        if self.stopped {
            PersistenceMode::Stopped
        } else {
            self.effective_live()
        }
    }
}

/// The persistence coordinator: the single consumer of the ingress queue.
/// It assembles batches bounded by size and a deadline, and persists each
/// through the currently selected sink, diverting a batch to local files
/// when its primary write fails.
pub struct Coordinator<P: BatchSink, F: BatchSink> {
    queue: Arc<SampleQueue>,
    primary: Arc<P>,
    fallback: Arc<F>,
    batch_size: usize,
    batch_timeout: Duration,
    mode: Mutex<ModeState>,
    mode_events: broadcast::Sender<PersistenceMode>,
    persisted: AtomicU64,
    primary_written: AtomicU64,
    fallback_written: AtomicU64,
    lost: AtomicU64,
    batches: AtomicU64,
}

/// Upper bound on a single empty-queue wait; the consumer re-arms in a loop
/// so shutdown never waits on it.
const IDLE_WAIT: Duration = Duration::from_secs(60);

impl<P: BatchSink, F: BatchSink> Coordinator<P, F> {
    pub fn new(
        queue: Arc<SampleQueue>,
        primary: Arc<P>,
        fallback: Arc<F>,
        batch_size: usize,
        batch_timeout: Duration,
        force_fallback: bool,
        dry_run: bool,
    ) -> Arc<Self> {
        let forced = if dry_run {
            Some(PersistenceMode::DryRun)
        } else if force_fallback {
            Some(PersistenceMode::Fallback)
        } else {
            None
        };
        let (mode_events, _) = broadcast::channel(16);
        Arc::new(Self {
            queue,
            primary,
            fallback,
            batch_size: batch_size.max(1),
            batch_timeout,
            mode: Mutex::new(ModeState {
                health_mode: PersistenceMode::Primary,
                forced,
                stopped: false,
            }),
            mode_events,
            persisted: AtomicU64::new(0),
            primary_written: AtomicU64::new(0),
            fallback_written: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        })
    }

    /// The currently effective persistence mode.
    pub fn mode(&self) -> PersistenceMode {
        self.mode.lock().unwrap().effective()
    }

    pub fn subscribe_mode(&self) -> broadcast::Receiver<PersistenceMode> {
        self.mode_events.subscribe()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            primary_written: self.primary_written.load(Ordering::Relaxed),
            fallback_written: self.fallback_written.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    /// Applies a health observation. Unhealthy selects Fallback and Healthy
    /// selects Primary; Degraded never forces a switch. Returns the
    /// (old, new) effective modes when the observation changed them.
    pub fn handle_health(&self, health: Health) -> Option<(PersistenceMode, PersistenceMode)> {
        let mut state = self.mode.lock().unwrap();
        let old = state.effective();
        match health {
            Health::Unhealthy => state.health_mode = PersistenceMode::Fallback,
            Health::Healthy => state.health_mode = PersistenceMode::Primary,
            Health::Degraded | Health::Unknown => return None,
        }
        let new = state.effective();
        drop(state);
        self.note_transition(old, new)
    }

    /// Sets or clears the operator override. Only Fallback and DryRun are
    /// override targets; anything else clears back to health-driven
    /// selection.
    pub fn force_mode(
        &self,
        forced: Option<PersistenceMode>,
    ) -> Option<(PersistenceMode, PersistenceMode)> {
        let mut state = self.mode.lock().unwrap();
        let old = state.effective();
        state.forced = match forced {
            Some(PersistenceMode::Fallback) => Some(PersistenceMode::Fallback),
            Some(PersistenceMode::DryRun) => Some(PersistenceMode::DryRun),
            _ => None,
        };
        let new = state.effective();
        drop(state);
        self.note_transition(old, new)
    }

    fn note_transition(
        &self,
        old: PersistenceMode,
        new: PersistenceMode,
    ) -> Option<(PersistenceMode, PersistenceMode)> {
        if old == new {
            return None;
        }
        tracing::info!(?old, ?new, "persistence mode changed");
        let _ = self.mode_events.send(new);
        Some((old, new))
    }

    /// Consumes the queue until cancelled, then drains whatever remains
    /// using the policy that was live at shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let ready = tokio::select! {
                () = cancel.cancelled() => break,
                ready = self.queue.wait_non_empty(IDLE_WAIT) => ready,
            };
            if !ready {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            }

            let batch = self.assemble(&cancel).await;
            if !batch.is_empty() {
                self.flush(self.mode(), &batch).await;
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        self.drain().await;
    }

    /// Batch assembly: drain what is immediately available, then wait out
    /// the remainder of the batch deadline for more. A full batch flushes
    /// without sleeping.
    async fn assemble(&self, cancel: &CancellationToken) -> Vec<Sample> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let deadline = tokio::time::Instant::now() + self.batch_timeout;
        loop {
            while batch.len() < self.batch_size {
                match self.queue.try_pop() {
                    Some(sample) => batch.push(sample),
                    None => break,
                }
            }
            if batch.len() >= self.batch_size {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let more = tokio::select! {
                () = cancel.cancelled() => break,
                more = self.queue.wait_non_empty(deadline - now) => more,
            };
            if !more {
                break;
            }
        }
        batch
    }

    async fn flush(&self, mode: PersistenceMode, batch: &[Sample]) {
        let count = batch.len() as u64;
        self.batches.fetch_add(1, Ordering::Relaxed);
        match mode {
            PersistenceMode::DryRun => {
                self.persisted.fetch_add(count, Ordering::Relaxed);
                tracing::debug!(samples = count, "dry-run batch discarded");
            }
            PersistenceMode::Fallback => self.write_fallback(batch).await,
            PersistenceMode::Primary | PersistenceMode::Stopped => {
                match self.primary.write(batch).await {
                    Ok(()) => {
                        self.persisted.fetch_add(count, Ordering::Relaxed);
                        self.primary_written.fetch_add(count, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(?err, samples = count, "primary write failed; diverting batch to fallback");
                        self.write_fallback(batch).await;
                    }
                }
            }
        }
    }

    async fn write_fallback(&self, batch: &[Sample]) {
        let count = batch.len() as u64;
        match self.fallback.write(batch).await {
            Ok(()) => {
                self.persisted.fetch_add(count, Ordering::Relaxed);
                self.fallback_written.fetch_add(count, Ordering::Relaxed);
            }
            Err(err) => {
                self.lost.fetch_add(count, Ordering::Relaxed);
                tracing::error!(?err, samples = count, "fallback write failed; samples permanently lost");
            }
        }
    }

    async fn drain(&self) {
        let policy = {
            let mut state = self.mode.lock().unwrap();
            let policy = state.effective_live();
            state.stopped = true;
            policy
        };
        let _ = self.mode_events.send(PersistenceMode::Stopped);

        // Keep draining until the queue is closed *and* empty: the
        // supervisor tears acquisition down and closes the queue while this
        // runs, and nothing published before the close may be left behind.
        let mut drained = 0usize;
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match self.queue.try_pop() {
                    Some(sample) => batch.push(sample),
                    None => break,
                }
            }
            if batch.is_empty() {
                if self.queue.is_closed() {
                    break;
                }
                let _ = self.queue.wait_non_empty(Duration::from_millis(50)).await;
                continue;
            }
            drained += batch.len();
            self.flush(policy, &batch).await;
        }
        if drained > 0 {
            tracing::info!(samples = drained, "drained ingress queue on shutdown");
        }
        tracing::debug!("persistence coordinator stopped");
    }
}
