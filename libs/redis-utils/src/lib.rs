//! Shared Redis connection handling.
//!
//! Commands go through a single multiplexed [`ConnectionManager`] which
//! reconnects transparently. Pub/sub requires dedicated connections, so the
//! pool also hands out the underlying [`Client`] for subscribers.
//!
//! Idle-connection reapers between the service and Redis (load balancers,
//! service meshes) silently drop quiet sockets; callers that care pass a
//! keepalive interval sized from whatever liveness window they already
//! maintain, and the pool pings the multiplexed connection on that cadence.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct RedisPool {
    client: Client,
    manager: ConnectionManager,
    _keepalive: Option<JoinHandle<()>>,
}

impl RedisPool {
    /// Connect and, when `keepalive` is set, keep the multiplexed
    /// connection warm with a PING on that interval. The delivery service
    /// sizes this off the presence TTL: presence bindings lapse when Redis
    /// becomes unreachable, so the connection must never idle out for a
    /// comparable window.
    pub async fn connect(redis_url: &str, keepalive: Option<Duration>) -> Result<Self> {
        let client =
            Client::open(redis_url).context("failed to parse REDIS_URL connection string")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to establish redis connection")?;

        let keepalive_task = keepalive.map(|interval| {
            let mut conn = manager.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                        Ok(_) => debug!("redis keepalive ping ok"),
                        Err(e) => warn!(error = %e, "redis keepalive ping failed"),
                    }
                }
            })
        });

        Ok(Self {
            client,
            manager,
            _keepalive: keepalive_task,
        })
    }

    /// Multiplexed connection for regular commands. Cheap to clone.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Underlying client, for pub/sub subscribers that need a dedicated
    /// connection.
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
