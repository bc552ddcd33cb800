use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Three-state breaker gating primary writes.
///
/// Closed admits work until `threshold` consecutive failures open it. Open
/// fast-fails until `cooldown` elapses, at which point the first `allow`
/// moves to HalfOpen and admits exactly one probe. A probe success closes
/// the circuit; a probe failure re-opens it immediately.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_issued: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        assert!(threshold > 0, "failure threshold must be non-zero");
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_issued: false,
            }),
        }
    }

    /// Whether a primary write may be issued now. Reading may transition
    /// Open to HalfOpen once the cooldown has elapsed; that first read is
    /// the HalfOpen probe and subsequent reads are refused until its outcome
    /// is recorded.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    tracing::info!("circuit breaker cooldown elapsed; admitting half-open probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_issued = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_issued {
                    false
                } else {
                    inner.probe_issued = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_issued = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_issued = false;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("half-open probe failed; circuit breaker re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_issued = false;
            }
            // A write begun before the circuit opened may report its failure
            // after the fact. The opened-at stamp is not refreshed for it.
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_fast_fails() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Within the cooldown no work is admitted.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // The probe is outstanding; no further work admitted.
        assert!(!breaker.allow());
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(COOLDOWN + Duration::from_secs(1)).await;
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());

        // Open again, probe fails, and the cooldown restarts.
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(COOLDOWN + Duration::from_secs(1)).await;
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        tokio::time::advance(COOLDOWN + Duration::from_secs(1)).await;
        assert!(breaker.allow());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(5, COOLDOWN);
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
