//! Presence watcher: fans presence transitions out to interested sessions.
//!
//! Subscribes to the presence channel and pushes an envelope-wrapped
//! `presence_updated` event into the sessions of every user who shares a
//! conversation with the subject, resolved through the membership cache's
//! reverse index. The subject's own sessions are skipped.

use crate::delivery::MembershipCache;
use crate::session::Registry;
use event_schema::{EventEnvelope, EventType, PresenceUpdatedEvent};
use futures_util::StreamExt;
use redis::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct PresenceWatcher {
    client: Client,
    registry: Arc<Registry>,
    membership: Arc<MembershipCache>,
}

impl PresenceWatcher {
    pub fn new(client: Client, registry: Arc<Registry>, membership: Arc<MembershipCache>) -> Self {
        Self {
            client,
            registry,
            membership,
        }
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "presence watcher: pubsub connect failed");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(super::PRESENCE_CHANNEL).await {
                error!(error = %e, "presence watcher: subscribe failed");
                return;
            }
            info!(channel = super::PRESENCE_CHANNEL, "presence watcher subscribed");

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("presence watcher stopping");
                            return;
                        }
                    }
                    msg = stream.next() => {
                        let msg = match msg {
                            Some(msg) => msg,
                            None => {
                                warn!("presence watcher: channel closed");
                                return;
                            }
                        };
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "presence watcher: bad payload");
                                continue;
                            }
                        };
                        let event: PresenceUpdatedEvent = match serde_json::from_slice(&payload) {
                            Ok(e) => e,
                            Err(e) => {
                                warn!(error = %e, "presence watcher: undecodable event");
                                continue;
                            }
                        };
                        self.handle_update(event);
                    }
                }
            }
        });
    }

    fn handle_update(&self, event: PresenceUpdatedEvent) {
        let conversation_ids = self.membership.user_conversations(event.user_id);
        if conversation_ids.is_empty() {
            return;
        }

        let envelope =
            match EventEnvelope::new(EventType::PresenceUpdated, event.occurred_at, &event) {
                Ok(env) => env,
                Err(e) => {
                    error!(error = %e, "presence watcher: envelope build failed");
                    return;
                }
            };
        let payload = match envelope.to_bytes() {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(_) => return,
            },
            Err(e) => {
                error!(error = %e, "presence watcher: envelope encode failed");
                return;
            }
        };

        self.notify_conversation_peers(event.user_id, &conversation_ids, &payload);
    }

    /// Each peer is notified at most once, however many conversations they
    /// share with the subject.
    fn notify_conversation_peers(
        &self,
        subject: Uuid,
        conversation_ids: &[Uuid],
        payload: &str,
    ) {
        let mut notified: HashSet<Uuid> = HashSet::new();
        notified.insert(subject);

        for conversation_id in conversation_ids {
            for member in self.membership.members(*conversation_id) {
                if notified.contains(&member) {
                    continue;
                }
                let sessions = self.registry.user_sessions(member);
                for session in &sessions {
                    session.try_send(payload);
                }
                if !sessions.is_empty() {
                    notified.insert(member);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use chrono::Utc;
    use event_schema::PresenceStatus;

    fn watcher_parts() -> (Arc<Registry>, Arc<MembershipCache>, PresenceWatcher) {
        let registry = Arc::new(Registry::new());
        let membership = Arc::new(MembershipCache::new());
        let watcher = PresenceWatcher::new(
            Client::open("redis://127.0.0.1:6379").unwrap(),
            registry.clone(),
            membership.clone(),
        );
        (registry, membership, watcher)
    }

    #[test]
    fn peers_sharing_a_conversation_are_notified_once() {
        let (registry, membership, watcher) = watcher_parts();
        let subject = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        // Peer shares two conversations with the subject.
        membership.set_members(conv_a, &[subject, peer]);
        membership.set_members(conv_b, &[subject, peer]);

        let (session, mut rx) = Session::new(peer, "d1".into(), 8);
        session.flush_buffer_sorted();
        registry.add(session);

        let event = PresenceUpdatedEvent {
            user_id: subject,
            status: PresenceStatus::Online,
            occurred_at: Utc::now(),
        };
        watcher.handle_update(event);

        assert!(rx.try_recv().is_ok());
        // Deduplicated across the two shared conversations.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subject_own_sessions_are_skipped() {
        let (registry, membership, watcher) = watcher_parts();
        let subject = Uuid::new_v4();
        let conv = Uuid::new_v4();
        membership.set_members(conv, &[subject]);

        let (session, mut rx) = Session::new(subject, "d1".into(), 8);
        session.flush_buffer_sorted();
        registry.add(session);

        watcher.handle_update(PresenceUpdatedEvent {
            user_id: subject,
            status: PresenceStatus::Offline,
            occurred_at: Utc::now(),
        });

        assert!(rx.try_recv().is_err());
    }
}
