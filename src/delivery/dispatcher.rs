//! Event dispatcher: the fan-out core of the delivery fabric.
//!
//! Driven by two inputs: records consumed from the event log, and payloads
//! received on this instance's cross-instance bus channel. Both decode the
//! envelope, resolve the conversation's members, and deliver to each local
//! session; only the log path forwards to remote instances (a remote
//! forward would loop).
//!
//! Membership-cache ordering is the load-bearing rule here: additions are
//! applied before fan-out so a new member receives the very event that
//! added them, removals after fan-out so a removed member still receives
//! the final membership change.

use crate::delivery::MembershipCache;
use crate::error::AppResult;
use crate::session::Registry;
use async_trait::async_trait;
use event_schema::{EventEnvelope, EventType, MembershipChangedEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Authoritative membership, consulted on cache miss.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn conversation_members(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>>;
}

/// Device -> owning-instance map as of the read. A device that moved between
/// read and delivery no-ops locally; the client repairs by resuming.
#[async_trait]
pub trait PresenceLookup: Send + Sync {
    async fn user_devices(&self, user_id: Uuid) -> AppResult<HashMap<String, String>>;
}

/// Fire-and-forget publish to another instance's delivery channel.
#[async_trait]
pub trait InstanceBus: Send + Sync {
    async fn publish(&self, instance_id: &str, payload: &[u8]) -> AppResult<()>;
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    membership: Arc<MembershipCache>,
    presence: Arc<dyn PresenceLookup>,
    bus: Arc<dyn InstanceBus>,
    conversations: Arc<dyn MembershipSource>,
    instance_id: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        membership: Arc<MembershipCache>,
        presence: Arc<dyn PresenceLookup>,
        bus: Arc<dyn InstanceBus>,
        conversations: Arc<dyn MembershipSource>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            membership,
            presence,
            bus,
            conversations,
            instance_id,
        }
    }

    /// Entry point for records consumed from the event log.
    pub async fn handle(&self, record: &[u8]) {
        let envelope = match EventEnvelope::from_bytes(record) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "dispatcher: undecodable event record");
                return;
            }
        };

        match envelope.event_type {
            EventType::MessageSent
            | EventType::MessageDeleted
            | EventType::ReadReceiptUpdated
            | EventType::MembershipChanged
            | EventType::ConversationCreated => self.handle_event(&envelope, record).await,
            // Presence updates travel on their own channel and are pushed by
            // the presence watcher.
            EventType::PresenceUpdated => {}
        }
    }

    async fn handle_event(&self, envelope: &EventEnvelope, record: &[u8]) {
        self.apply_pre_route_membership(envelope);

        let conversation_id = match envelope.conversation_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "dispatcher: cannot resolve conversation");
                return;
            }
        };

        let members = match self.members_with_refill(conversation_id).await {
            Some(members) => members,
            None => return,
        };

        let payload = match std::str::from_utf8(record) {
            Ok(s) => s.to_string(),
            Err(e) => {
                error!(error = %e, "dispatcher: non-utf8 event record");
                return;
            }
        };

        let remote_instances = self.fan_out(envelope, &members, &payload).await;

        // Publish the raw envelope once per distinct remote instance.
        for instance in &remote_instances {
            match self.bus.publish(instance, record).await {
                Ok(()) => {
                    crate::metrics::EVENTS_DISPATCHED_TOTAL
                        .with_label_values(&["remote"])
                        .inc();
                    debug!(instance = %instance, %conversation_id, "dispatcher: forwarded to remote instance");
                }
                Err(e) => {
                    error!(error = %e, instance = %instance, "dispatcher: remote routing failed");
                }
            }
        }

        self.apply_post_route_membership(envelope);
    }

    /// Entry point for payloads from the cross-instance bus. Local delivery
    /// only; no further forwarding.
    pub async fn deliver_remote(&self, record: &[u8]) {
        let envelope = match EventEnvelope::from_bytes(record) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "dispatcher: undecodable bus payload");
                return;
            }
        };

        let conversation_id = match envelope.conversation_id() {
            Ok(id) => id,
            Err(_) => return,
        };

        let members = match self.members_with_refill(conversation_id).await {
            Some(members) => members,
            None => return,
        };

        let payload = match std::str::from_utf8(record) {
            Ok(s) => s.to_string(),
            Err(e) => {
                error!(error = %e, "dispatcher: non-utf8 bus payload");
                return;
            }
        };

        // The registry is authoritative for this replica; skip the presence
        // lookup and deliver to whatever sessions are here.
        for user_id in members {
            for session in self.registry.user_sessions(user_id) {
                self.deliver_to_session(&session, &envelope, &payload);
            }
        }
    }

    /// Members from the cache, refilled from the conversation service on
    /// miss. An empty cache entry is treated as a miss (instance restart).
    async fn members_with_refill(&self, conversation_id: Uuid) -> Option<Vec<Uuid>> {
        let members = self.membership.members(conversation_id);
        if !members.is_empty() {
            return Some(members);
        }

        info!(%conversation_id, "dispatcher: membership cache miss, refilling");
        match self.conversations.conversation_members(conversation_id).await {
            Ok(members) => {
                self.membership.set_members(conversation_id, &members);
                Some(members)
            }
            Err(e) => {
                error!(error = %e, %conversation_id, "dispatcher: membership refill failed");
                None
            }
        }
    }

    /// Deliver to local sessions of every member; collect the set of remote
    /// instances owning the rest of the devices. Presence lookups for the
    /// members run concurrently.
    async fn fan_out(
        &self,
        envelope: &EventEnvelope,
        members: &[Uuid],
        payload: &str,
    ) -> HashSet<String> {
        let lookups = members.iter().map(|&user_id| {
            let presence = Arc::clone(&self.presence);
            async move { (user_id, presence.user_devices(user_id).await) }
        });
        let resolved = futures::future::join_all(lookups).await;

        let mut remote_instances = HashSet::new();
        for (user_id, devices) in resolved {
            let devices = match devices {
                Ok(devices) => devices,
                Err(e) => {
                    error!(error = %e, %user_id, "dispatcher: presence lookup failed");
                    continue;
                }
            };

            for (device_id, instance) in devices {
                if instance == self.instance_id {
                    for session in self.registry.user_sessions(user_id) {
                        if session.device_id == device_id {
                            self.deliver_to_session(&session, envelope, payload);
                        }
                    }
                } else {
                    remote_instances.insert(instance);
                }
            }
        }
        remote_instances
    }

    fn deliver_to_session(
        &self,
        session: &crate::session::Session,
        envelope: &EventEnvelope,
        payload: &str,
    ) {
        if session.buffer(envelope, payload) {
            crate::metrics::EVENTS_DISPATCHED_TOTAL
                .with_label_values(&["buffered"])
                .inc();
        } else if session.try_send(payload) {
            crate::metrics::EVENTS_DISPATCHED_TOTAL
                .with_label_values(&["local"])
                .inc();
        }
    }

    /// Additions are visible before fan-out so the new member receives the
    /// triggering event.
    fn apply_pre_route_membership(&self, envelope: &EventEnvelope) {
        match envelope.event_type {
            EventType::ConversationCreated => {
                if let Ok(event) = envelope.decode::<event_schema::ConversationCreatedEvent>() {
                    self.membership
                        .set_members(event.conversation.conversation_id, &event.participant_user_ids);
                }
            }
            EventType::MembershipChanged => {
                if let Ok(event) = envelope.decode::<MembershipChangedEvent>() {
                    if event.added {
                        self.membership.add(event.conversation_id, event.user_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Removals are applied after fan-out so the removed member still got
    /// the final membership change.
    fn apply_post_route_membership(&self, envelope: &EventEnvelope) {
        if envelope.event_type != EventType::MembershipChanged {
            return;
        }
        if let Ok(event) = envelope.decode::<MembershipChangedEvent>() {
            if !event.added {
                self.membership.remove(event.conversation_id, event.user_id);
            }
        }
    }
}
