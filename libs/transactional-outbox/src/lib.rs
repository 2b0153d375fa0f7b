//! Transactional outbox: reliable event publishing for the messaging fabric.
//!
//! State-changing transactions append a row to `outbox_events`; commit
//! atomicity guarantees exactly one row per logical event. A background
//! worker claims unprocessed rows in id order with `FOR UPDATE SKIP LOCKED`
//! (so worker replicas never double-pick), publishes each to the event log
//! keyed by the aggregate id, and marks the batch processed in the same
//! transaction. The log is assumed at-least-once: a mid-batch failure rolls
//! the whole batch back and the next pass republishes it.
//!
//! A row whose publish keeps failing is retried up to a ceiling and then
//! moved to `outbox_dlq` with its terminal error, so one poisoned event
//! cannot wedge the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;

/// One row of the `outbox_events` table.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_type: String,
    /// Partition key on the event log (conversation id for messaging events).
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// Destination of outbox rows. Implementations must tolerate re-publishing
/// the same event (the log contract is at-least-once).
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, key: &str, event_type: &str, payload: &[u8]) -> OutboxResult<()>;
}

/// Kafka publisher. The producer must run with `enable.idempotence=true` and
/// `acks=all`; the aggregate id key keeps per-conversation order on one
/// partition.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaOutboxPublisher {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, key: &str, event_type: &str, payload: &[u8]) -> OutboxResult<()> {
        let headers = OwnedHeaders::new().insert(Header {
            key: "event_type",
            value: Some(event_type.as_bytes()),
        });

        let record = FutureRecord::to(&self.topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(err.to_string()))?;

        debug!(topic = %self.topic, key, event_type, "event published");
        Ok(())
    }
}

/// SQL access to the outbox tables.
#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append an event inside the caller's transaction. Must run in the same
    /// transaction as the state change it describes.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (aggregate_type, aggregate_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(event_type)
        .bind(payload)
        .execute(&mut **tx)
        .await?;

        debug!(%aggregate_id, event_type, "event enqueued in outbox");
        Ok(())
    }

    /// Claim up to `limit` unprocessed rows in insertion order. Skip-locked
    /// acquisition keeps concurrent worker replicas from double-picking.
    pub async fn claim_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i32,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   created_at, processed_at, retry_count, last_error
            FROM outbox_events
            WHERE processed_at IS NULL
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                    processed_at: row.try_get("processed_at")?,
                    retry_count: row.try_get("retry_count")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    pub async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: i64,
    ) -> OutboxResult<()> {
        let result = sqlx::query("UPDATE outbox_events SET processed_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(event_id));
        }
        Ok(())
    }

    /// Record a failed publish attempt in its own short transaction (the
    /// batch transaction has already rolled back at this point). When the
    /// retry ceiling is reached the row moves to `outbox_dlq` atomically.
    ///
    /// Returns true when the event was dead-lettered.
    pub async fn record_failure(
        &self,
        event_id: i64,
        publish_error: &str,
        max_retries: i32,
    ) -> OutboxResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                last_error = $2
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .bind(publish_error)
        .fetch_optional(&mut *tx)
        .await?;

        let retry_count: i32 = match row {
            Some(row) => row.try_get("retry_count")?,
            // Row vanished (concurrent worker dead-lettered it); nothing to do.
            None => {
                tx.rollback().await?;
                return Ok(false);
            }
        };

        let dead_lettered = retry_count >= max_retries;
        if dead_lettered {
            sqlx::query(
                r#"
                INSERT INTO outbox_dlq
                    (outbox_id, aggregate_type, aggregate_id, event_type, payload,
                     created_at, retry_count, last_error, failed_at)
                SELECT id, aggregate_type, aggregate_id, event_type, payload,
                       created_at, retry_count, last_error, NOW()
                FROM outbox_events
                WHERE id = $1
                "#,
            )
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM outbox_events WHERE id = $1")
                .bind(event_id)
                .execute(&mut *tx)
                .await?;

            warn!(event_id, retry_count, error = publish_error, "outbox event dead-lettered");
        }

        tx.commit().await?;
        Ok(dead_lettered)
    }

    /// Pending row count and age of the oldest pending row in seconds
    /// (0 when the outbox is empty). Feeds the worker gauges.
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS pending,
                   COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("pending")?, row.try_get("age_seconds")?))
    }
}

/// Background publisher loop. One per service instance.
pub struct OutboxWorker<P: OutboxPublisher> {
    repository: OutboxRepository,
    publisher: Arc<P>,
    batch_size: i32,
    poll_delay: Duration,
    max_retries: i32,
    metrics: Option<OutboxMetrics>,
}

/// Pause after a batch error before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

impl<P: OutboxPublisher> OutboxWorker<P> {
    pub fn new(
        repository: OutboxRepository,
        publisher: Arc<P>,
        batch_size: i32,
        poll_delay: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_delay,
            max_retries,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until the shutdown signal flips. Exits at an iteration boundary;
    /// an in-flight batch either commits or rolls back whole.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            poll_delay_ms = self.poll_delay.as_millis() as u64,
            max_retries = self.max_retries,
            "outbox worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.process_batch().await {
                Ok(0) => self.poll_delay,
                Ok(count) => {
                    debug!(published = count, "outbox batch published");
                    Duration::ZERO
                }
                Err(e) => {
                    error!(error = %e, "outbox batch failed");
                    ERROR_BACKOFF
                }
            };

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("outbox worker stopped");
    }

    /// Publish one batch. The claim, the publishes and the processed marks
    /// commit as a unit; the first failure rolls everything back, then the
    /// failed row's retry bookkeeping is persisted separately.
    async fn process_batch(&self) -> OutboxResult<usize> {
        let mut tx = self.repository.pool().begin().await?;
        let events = self.repository.claim_batch(&mut tx, self.batch_size).await?;

        if events.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut published = 0usize;
        for event in &events {
            let payload = serde_json::to_vec(&event.payload)?;
            let key = event.aggregate_id.to_string();

            match self.publisher.publish(&key, &event.event_type, &payload).await {
                Ok(()) => {
                    self.repository.mark_processed(&mut tx, event.id).await?;
                    published += 1;
                }
                Err(e) => {
                    tx.rollback().await?;

                    if let Some(metrics) = &self.metrics {
                        metrics.publish_failures.inc();
                    }
                    let dead_lettered = self
                        .repository
                        .record_failure(event.id, &e.to_string(), self.max_retries)
                        .await?;
                    if dead_lettered {
                        if let Some(metrics) = &self.metrics {
                            metrics.dead_lettered.inc();
                        }
                    }
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        if let Some(metrics) = &self.metrics {
            metrics.published.inc_by(published as u64);
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingPublisher {
        calls: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl OutboxPublisher for RecordingPublisher {
        async fn publish(&self, key: &str, event_type: &str, payload: &[u8]) -> OutboxResult<()> {
            if self.fail {
                return Err(OutboxError::PublishFailed("broker down".into()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((key.to_string(), event_type.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_receives_aggregate_id_as_key() {
        let publisher = RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail: false,
        };
        let aggregate_id = Uuid::new_v4();
        publisher
            .publish(&aggregate_id.to_string(), "message_sent", b"{}")
            .await
            .unwrap();

        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, aggregate_id.to_string());
        assert_eq!(calls[0].1, "message_sent");
    }

    #[tokio::test]
    async fn failing_publisher_surfaces_publish_failed() {
        let publisher = RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail: true,
        };
        let err = publisher.publish("k", "message_sent", b"{}").await.unwrap_err();
        assert!(matches!(err, OutboxError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn worker_exits_on_shutdown_signal() {
        let pool = PgPool::connect_lazy("postgres://localhost/unreachable").unwrap();
        let worker = OutboxWorker::new(
            OutboxRepository::new(pool),
            Arc::new(RecordingPublisher {
                calls: Mutex::new(Vec::new()),
                fail: false,
            }),
            100,
            Duration::from_millis(10),
            3,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        // Signal already set: run() must return at the first boundary.
        worker.run(shutdown_rx).await;
        drop(shutdown_tx);
    }
}
