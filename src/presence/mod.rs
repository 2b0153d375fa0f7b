//! Device presence over Redis.
//!
//! Two paired records per device: `session:<user>:<device>` holding the
//! owning instance id with TTL, and a per-user device set with a grace
//! period on top. A device counts as live only when both exist; set members
//! whose session key expired are pruned lazily on read.

pub mod watcher;

pub use watcher::PresenceWatcher;

use crate::delivery::PresenceLookup;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::Utc;
use event_schema::{PresenceStatus, PresenceUpdatedEvent};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Channel carrying raw `PresenceUpdatedEvent` payloads; the watcher wraps
/// them into envelopes before pushing to sessions.
pub const PRESENCE_CHANNEL: &str = "presence:updates";

/// Extra lifetime on the device set beyond the session-key TTL.
const SET_TTL_GRACE: Duration = Duration::from_secs(3600);

fn session_key(user_id: Uuid, device_id: &str) -> String {
    format!("session:{user_id}:{device_id}")
}

fn user_devices_key(user_id: Uuid) -> String {
    format!("presence:user:{user_id}:devices")
}

pub struct Presence {
    conn: ConnectionManager,
    instance_id: String,
    ttl: Duration,
}

impl Presence {
    pub fn new(conn: ConnectionManager, instance_id: String, ttl: Duration) -> Self {
        Self {
            conn,
            instance_id,
            ttl,
        }
    }

    /// Bind a device to this instance and announce ONLINE.
    pub async fn register(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(
                session_key(user_id, device_id),
                &self.instance_id,
                self.ttl.as_secs(),
            )
            .sadd(user_devices_key(user_id), device_id)
            .expire(
                user_devices_key(user_id),
                (self.ttl + SET_TTL_GRACE).as_secs() as i64,
            )
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.publish_update(user_id, PresenceStatus::Online).await
    }

    /// Drop the binding; announce OFFLINE when it was the last live device.
    pub async fn unregister(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(session_key(user_id, device_id))
            .srem(user_devices_key(user_id), device_id)
            .query_async::<_, ()>(&mut conn)
            .await?;

        match self.get_user_devices(user_id).await {
            Ok(devices) if !devices.is_empty() => Ok(()),
            _ => self.publish_update(user_id, PresenceStatus::Offline).await,
        }
    }

    /// Extend both TTLs; called by the per-session heartbeat.
    pub async fn refresh(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .expire(session_key(user_id, device_id), self.ttl.as_secs() as i64)
            .expire(
                user_devices_key(user_id),
                (self.ttl + SET_TTL_GRACE).as_secs() as i64,
            )
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Live device -> instance map. Stale set members (expired session key)
    /// are pruned asynchronously.
    pub async fn get_user_devices(&self, user_id: Uuid) -> AppResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();

        let device_ids: Vec<String> = conn.smembers(user_devices_key(user_id)).await?;
        if device_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = device_ids
            .iter()
            .map(|d| session_key(user_id, d))
            .collect();
        let instances: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut result = HashMap::new();
        let mut stale: Vec<String> = Vec::new();
        for (device_id, instance) in device_ids.into_iter().zip(instances) {
            match instance {
                Some(instance) => {
                    result.insert(device_id, instance);
                }
                None => stale.push(device_id),
            }
        }

        if !stale.is_empty() {
            let mut prune_conn = self.conn.clone();
            tokio::spawn(async move {
                if let Err(e) = prune_conn
                    .srem::<_, _, ()>(user_devices_key(user_id), &stale)
                    .await
                {
                    warn!(error = %e, %user_id, "failed to prune stale presence devices");
                }
            });
        }

        Ok(result)
    }

    /// True when the user has at least one live device anywhere.
    pub async fn is_online(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(!self.get_user_devices(user_id).await?.is_empty())
    }

    async fn publish_update(&self, user_id: Uuid, status: PresenceStatus) -> AppResult<()> {
        let event = PresenceUpdatedEvent {
            user_id,
            status,
            occurred_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|e| AppError::Internal(format!("presence event: {e}")))?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(PRESENCE_CHANNEL, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl PresenceLookup for Presence {
    async fn user_devices(&self, user_id: Uuid) -> AppResult<HashMap<String, String>> {
        self.get_user_devices(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let user = Uuid::nil();
        assert_eq!(
            session_key(user, "phone"),
            "session:00000000-0000-0000-0000-000000000000:phone"
        );
        assert_eq!(
            user_devices_key(user),
            "presence:user:00000000-0000-0000-0000-000000000000:devices"
        );
    }
}
