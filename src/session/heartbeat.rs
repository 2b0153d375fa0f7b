//! Per-session presence heartbeat.

use crate::presence::Presence;
use crate::session::wait_closed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::warn;
use uuid::Uuid;

/// Refresh the device's presence binding every `interval` until the session
/// signals done.
pub fn start(
    presence: Arc<Presence>,
    user_id: Uuid,
    device_id: String,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = presence.refresh(user_id, &device_id).await {
                        warn!(error = %e, %user_id, device_id = %device_id, "presence refresh failed");
                    }
                }
                _ = wait_closed(&mut done) => {
                    return;
                }
            }
        }
    });
}
