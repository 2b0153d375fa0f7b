//! Prometheus instrumentation for the outbox worker.

use prometheus::{IntCounter, IntGauge, Registry};

#[derive(Clone)]
pub struct OutboxMetrics {
    pub published: IntCounter,
    pub publish_failures: IntCounter,
    pub dead_lettered: IntCounter,
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
}

impl OutboxMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::new(
            "outbox_events_published_total",
            "Outbox events successfully published to the event log",
        )?;
        let publish_failures = IntCounter::new(
            "outbox_publish_failures_total",
            "Outbox publish attempts that failed",
        )?;
        let dead_lettered = IntCounter::new(
            "outbox_events_dead_lettered_total",
            "Outbox events moved to the dead-letter table",
        )?;
        let pending = IntGauge::new("outbox_events_pending", "Unprocessed outbox rows")?;
        let oldest_pending_age_seconds = IntGauge::new(
            "outbox_oldest_pending_age_seconds",
            "Age of the oldest unprocessed outbox row",
        )?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(oldest_pending_age_seconds.clone()))?;

        Ok(Self {
            published,
            publish_failures,
            dead_lettered,
            pending,
            oldest_pending_age_seconds,
        })
    }
}
