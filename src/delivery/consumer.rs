//! Event-log consumer driving the dispatcher.
//!
//! Joins the `delivery-service` consumer group; partition assignment plus
//! the conversation-id partition key give per-conversation ordering. Offsets
//! auto-commit, so an instance crash replays from the last committed offset
//! (the log contract is at-least-once).

use crate::delivery::Dispatcher;
use crate::error::{AppError, AppResult};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CONSUMER_GROUP: &str = "delivery-service";

pub struct EventLogConsumer {
    consumer: StreamConsumer,
    dispatcher: Arc<Dispatcher>,
}

impl EventLogConsumer {
    pub fn new(
        brokers: &str,
        topics: &[String],
        dispatcher: Arc<Dispatcher>,
    ) -> AppResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", CONSUMER_GROUP)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| AppError::StartServer(format!("kafka consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| AppError::StartServer(format!("kafka subscribe: {e}")))?;

        info!(?topics, group = CONSUMER_GROUP, "event log consumer subscribed");
        Ok(Self {
            consumer,
            dispatcher,
        })
    }

    /// Consume until the shutdown signal flips; exits at the next iteration
    /// boundary. Offsets for a crashed in-flight record are not advanced
    /// past the last commit, so it is redelivered.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event log consumer stopping");
                        return;
                    }
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            match message.payload() {
                                Some(payload) => self.dispatcher.handle(payload).await,
                                None => warn!("event log record with empty payload, skipping"),
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "event log recv failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}
