mod breaker;
mod coordinator;
mod encode;
mod fallback;
mod health;
mod mongo;
mod recovery;

pub use breaker::{CircuitBreaker, CircuitState};
pub use coordinator::{Coordinator, CoordinatorStats, PersistenceMode};
pub use fallback::FallbackSink;
pub use health::{Health, HealthMonitor, MongoProbe, Probe};
pub use mongo::MongoSink;
pub use recovery::{RecoveryEvent, RecoveryService};

use telemetry::Sample;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("circuit breaker is open; refusing primary write")]
    CircuitOpen,
    #[error("primary write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode sample as a fallback record")]
    Encode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A sink which durably accepts batches of samples.
///
/// `write` returns Ok only when the whole batch is accepted (the primary
/// sink's documented partial-success case counts as accepted). Errors are
/// batch-level: callers decide whether to divert the batch elsewhere, and
/// never retry it against the same sink.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn write(&self, batch: &[Sample]) -> Result<()>;
}
