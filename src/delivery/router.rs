//! Cross-instance delivery bus over Redis pub/sub.
//!
//! Channel names are `delivery:<instance-id>`; payloads are opaque envelope
//! bytes. The bus is intentionally non-durable: the event log remains the
//! recovery point and clients repair any loss by resuming.

use crate::error::{AppError, AppResult};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct Router {
    conn: ConnectionManager,
    client: Client,
    instance_id: String,
}

fn channel(instance_id: &str) -> String {
    format!("delivery:{instance_id}")
}

impl Router {
    pub fn new(conn: ConnectionManager, client: Client, instance_id: String) -> Self {
        Self {
            conn,
            client,
            instance_id,
        }
    }

    pub async fn publish(&self, target_instance: &str, payload: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel(target_instance), payload)
            .await?;
        Ok(())
    }

    /// Subscribe to this instance's channel and feed every payload to
    /// `handler` until shutdown. Runs as its own task.
    pub fn subscribe<F, Fut>(&self, handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let client = self.client.clone();
        let channel_name = channel(&self.instance_id);

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, channel = %channel_name, "router: pubsub connect failed");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel_name).await {
                error!(error = %e, channel = %channel_name, "router: subscribe failed");
                return;
            }
            info!(channel = %channel_name, "router: subscribed");

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("router: subscription loop stopping");
                            return;
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let payload: Vec<u8> = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        warn!(error = %e, "router: bad payload");
                                        continue;
                                    }
                                };
                                handler(payload).await;
                            }
                            None => {
                                warn!("router: pubsub channel closed");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl super::InstanceBus for Router {
    async fn publish(&self, instance_id: &str, payload: &[u8]) -> AppResult<()> {
        Router::publish(self, instance_id, payload)
            .await
            .map_err(|e| AppError::Unavailable(format!("delivery bus: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_per_instance() {
        assert_eq!(channel("a"), "delivery:a");
        assert_ne!(channel("a"), channel("b"));
    }
}
