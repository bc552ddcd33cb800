use crate::{Error, Result};
use mongodb::bson::doc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Classification of the primary store's liveness.
///
/// Degraded distinguishes reachable-but-slow from Unhealthy, which is only
/// reached after repeated probe failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Health {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// A liveness probe against the primary store.
#[async_trait::async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self) -> Result<()>;
}

/// The production probe: a dedicated, aggressively-timed client connection
/// used only for `ping` commands, so probe latency reflects the server and
/// not a busy shared connection pool.
pub struct MongoProbe {
    client: mongodb::Client,
    database: String,
}

impl MongoProbe {
    pub async fn connect(uri: &str, database: &str, probe_timeout: Duration) -> Result<Self> {
        let mut options = mongodb::options::ClientOptions::parse(uri).await?;
        options.app_name = Some("fieldgate-health".to_string());
        options.connect_timeout = Some(probe_timeout);
        options.server_selection_timeout = Some(probe_timeout);
        options.max_pool_size = Some(1);
        let client = mongodb::Client::with_options(options)?;
        Ok(Self {
            client,
            database: database.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Probe for MongoProbe {
    async fn probe(&self) -> Result<()> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

struct MonitorState {
    health: Health,
    consecutive_failures: u32,
}

/// Periodically probes the primary store and classifies it as Healthy,
/// Degraded, or Unhealthy. A Health event is broadcast iff the
/// classification changed; the latest classification is always readable
/// through `current` or the watch channel.
pub struct HealthMonitor<P: Probe> {
    probe: P,
    interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
    degraded_latency: Duration,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<Health>,
    latest: watch::Sender<Health>,
}

impl<P: Probe> HealthMonitor<P> {
    pub fn new(
        probe: P,
        interval: Duration,
        probe_timeout: Duration,
        failure_threshold: u32,
        degraded_latency: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (latest, _) = watch::channel(Health::Unknown);
        Self {
            probe,
            interval,
            probe_timeout,
            failure_threshold: failure_threshold.max(1),
            degraded_latency,
            state: Mutex::new(MonitorState {
                health: Health::Unknown,
                consecutive_failures: 0,
            }),
            events,
            latest,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Health> {
        self.events.subscribe()
    }

    /// A receiver that always holds the latest classification, for consumers
    /// that poll rather than react (e.g. the recovery worker between batches).
    pub fn watch(&self) -> watch::Receiver<Health> {
        self.latest.subscribe()
    }

    pub fn current(&self) -> Health {
        self.state.lock().unwrap().health
    }

    /// Forces a probe before returning the resulting classification.
    pub async fn check_now(&self) -> Health {
        self.probe_once().await
    }

    /// Runs the probe loop until cancelled. Shutdown is cooperative: a probe
    /// in flight is bounded by its own timeout.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.probe_once().await;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => (),
            }
        }
        tracing::debug!("health monitor stopped");
    }

    async fn probe_once(&self) -> Health {
        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, self.probe.probe()).await;
        let elapsed = started.elapsed();

        let classified = {
            let mut state = self.state.lock().unwrap();
            let classified = match outcome {
                Ok(Ok(())) => {
                    state.consecutive_failures = 0;
                    if elapsed <= self.degraded_latency {
                        Health::Healthy
                    } else {
                        Health::Degraded
                    }
                }
                Ok(Err(ref err)) => {
                    state.consecutive_failures += 1;
                    self.classify_failure(state.consecutive_failures, Some(err))
                }
                Err(_) => {
                    state.consecutive_failures += 1;
                    self.classify_failure(state.consecutive_failures, None)
                }
            };
            let changed = state.health != classified;
            state.health = classified;
            changed.then_some(classified)
        };

        if let Some(health) = classified {
            tracing::info!(?health, elapsed_ms = elapsed.as_millis() as u64, "primary store health changed");
            let _ = self.events.send(health);
            self.latest.send_replace(health);
            health
        } else {
            self.current()
        }
    }

    fn classify_failure(&self, failures: u32, err: Option<&Error>) -> Health {
        match err {
            Some(err) => tracing::warn!(?err, failures, "health probe failed"),
            None => tracing::warn!(failures, timeout = ?self.probe_timeout, "health probe timed out"),
        }
        if failures >= self.failure_threshold {
            Health::Unhealthy
        } else {
            Health::Degraded
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scripted probe: each call pops the next step.
    struct Scripted {
        steps: Vec<Step>,
        cursor: AtomicU32,
    }

    enum Step {
        Ok,
        Slow(Duration),
        Fail,
        Hang,
    }

    #[async_trait::async_trait]
    impl Probe for Scripted {
        async fn probe(&self) -> Result<()> {
            let index = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
            match self.steps.get(index).unwrap_or(&Step::Ok) {
                Step::Ok => Ok(()),
                Step::Slow(pause) => {
                    tokio::time::sleep(*pause).await;
                    Ok(())
                }
                Step::Fail => Err(Error::Io(std::io::Error::other("probe refused"))),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn monitor(steps: Vec<Step>) -> HealthMonitor<Scripted> {
        HealthMonitor::new(
            Scripted {
                steps,
                cursor: AtomicU32::new(0),
            },
            Duration::from_secs(5),
            Duration::from_secs(2),
            3,
            Duration::from_millis(500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fast_probe_is_healthy_slow_probe_is_degraded() {
        let monitor = monitor(vec![Step::Ok, Step::Slow(Duration::from_millis(600))]);
        assert_eq!(monitor.check_now().await, Health::Healthy);
        assert_eq!(monitor.check_now().await, Health::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_degrade_then_unhealthy_at_threshold() {
        let monitor = monitor(vec![Step::Fail, Step::Fail, Step::Fail, Step::Ok]);
        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Unhealthy);
        // A single success recovers immediately.
        assert_eq!(monitor.check_now().await, Health::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_counts_as_failure() {
        let monitor = monitor(vec![Step::Hang, Step::Hang, Step::Hang]);
        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Degraded);
        assert_eq!(monitor.check_now().await, Health::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn events_fire_only_on_change() {
        let monitor = monitor(vec![Step::Ok, Step::Ok, Step::Fail, Step::Fail, Step::Fail]);
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.check_now().await;
        }
        // Unknown->Healthy, Healthy->Degraded, Degraded->Unhealthy.
        assert_eq!(events.recv().await.unwrap(), Health::Healthy);
        assert_eq!(events.recv().await.unwrap(), Health::Degraded);
        assert_eq!(events.recv().await.unwrap(), Health::Unhealthy);
        assert!(events.try_recv().is_err());
    }
}
