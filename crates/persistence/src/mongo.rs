use crate::{encode, BatchSink, CircuitBreaker, Error, Result};
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::Sample;

/// The primary sink: batched, unordered inserts into the configured MongoDB
/// collection, gated by the circuit breaker.
pub struct MongoSink {
    collection: mongodb::Collection<mongodb::bson::Document>,
    breaker: Arc<CircuitBreaker>,
    write_timeout: Duration,
    ttl_days: u32,
    indexes_ready: AtomicBool,
}

impl MongoSink {
    /// Builds the sink and schedules index bootstrap in the background.
    /// A failed bootstrap is retried lazily after the next successful write.
    pub fn new(
        collection: mongodb::Collection<mongodb::bson::Document>,
        breaker: Arc<CircuitBreaker>,
        write_timeout: Duration,
        ttl_days: u32,
    ) -> Arc<Self> {
        let sink = Arc::new(Self {
            collection,
            breaker,
            write_timeout,
            ttl_days,
            indexes_ready: AtomicBool::new(false),
        });
        let bootstrap = sink.clone();
        tokio::spawn(async move {
            bootstrap.ensure_indexes().await;
        });
        sink
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn ensure_indexes(&self) {
        if self.indexes_ready.load(Ordering::Acquire) {
            return;
        }
        let mut models = vec![
            // Node history.
            IndexModel::builder()
                .keys(doc! { "nodeId": 1, "sourceTimestamp": -1 })
                .build(),
            // Time scans.
            IndexModel::builder()
                .keys(doc! { "timestampUtc": -1 })
                .build(),
            // Per-server node history.
            IndexModel::builder()
                .keys(doc! { "serverId": 1, "nodeId": 1, "sourceTimestamp": -1 })
                .build(),
            // Per-server time scans.
            IndexModel::builder()
                .keys(doc! { "serverId": 1, "timestampUtc": -1 })
                .build(),
        ];
        if self.ttl_days > 0 {
            let expiry = Duration::from_secs(u64::from(self.ttl_days) * 24 * 60 * 60);
            models.push(
                IndexModel::builder()
                    .keys(doc! { "timestampUtc": 1 })
                    .options(IndexOptions::builder().expire_after(expiry).build())
                    .build(),
            );
        }

        match self.collection.create_indexes(models).await {
            Ok(_) => {
                tracing::info!(ttl_days = self.ttl_days, "datapoint indexes are in place");
                self.indexes_ready.store(true, Ordering::Release);
            }
            Err(err) => {
                tracing::warn!(?err, "index bootstrap failed; will retry after a successful write");
            }
        }
    }
}

#[async_trait::async_trait]
impl BatchSink for MongoSink {
    async fn write(&self, batch: &[Sample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if !self.breaker.allow() {
            return Err(Error::CircuitOpen);
        }

        let documents: Vec<_> = batch.iter().map(encode::sample_document).collect();
        let insert = self.collection.insert_many(documents).ordered(false);

        match tokio::time::timeout(self.write_timeout, insert).await {
            Ok(Ok(result)) => {
                self.breaker.record_success();
                tracing::debug!(inserted = result.inserted_ids.len(), "primary batch accepted");
                self.ensure_indexes().await;
                Ok(())
            }
            Ok(Err(err)) if batch_partially_succeeded(&err) => {
                // Some documents were rejected by a per-document constraint.
                // They are not retried; the batch counts as accepted.
                self.breaker.record_success();
                tracing::warn!(?err, "primary batch partially accepted; rejected documents dropped");
                self.ensure_indexes().await;
                Ok(())
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(err.into())
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(Error::WriteTimeout(self.write_timeout))
            }
        }
    }
}

/// True when the failure is a bulk-insert outcome in which only individual
/// documents were rejected (no write-concern failure), i.e. the server
/// accepted the rest of the batch.
fn batch_partially_succeeded(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        mongodb::error::ErrorKind::InsertMany(failure) => {
            failure.write_concern_error.is_none()
                && failure
                    .write_errors
                    .as_ref()
                    .is_some_and(|errors| !errors.is_empty())
        }
        _ => false,
    }
}
