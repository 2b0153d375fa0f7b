//! Versioned event schema shared by the messaging write path, the outbox
//! publisher and the delivery dispatcher.
//!
//! Every record on the event log is one [`EventEnvelope`] serialized as JSON.
//! The envelope carries the event type, a schema version for compatibility
//! checking, the producer-side timestamp and the typed payload. Consumers
//! dispatch on `event_type` and decode the payload into the matching struct
//! from [`events`].

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

pub mod events;

pub use events::{
    ConversationCreatedEvent, ConversationRecord, MembershipChangedEvent, MessageDeletedEvent,
    MessageRecord, MessageSentEvent, PresenceStatus, PresenceUpdatedEvent,
    ReadReceiptUpdatedEvent,
};

/// Current schema version stamped on every envelope.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("event type {0:?} carries no conversation id")]
    NoConversation(EventType),
}

/// Discriminant for the payload carried by an [`EventEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageSent,
    MessageDeleted,
    ReadReceiptUpdated,
    MembershipChanged,
    ConversationCreated,
    PresenceUpdated,
}

impl EventType {
    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageSent => "message_sent",
            EventType::MessageDeleted => "message_deleted",
            EventType::ReadReceiptUpdated => "read_receipt_updated",
            EventType::MembershipChanged => "membership_changed",
            EventType::ConversationCreated => "conversation_created",
            EventType::PresenceUpdated => "presence_updated",
        }
    }
}

/// Typed container for one event on the log or the cross-instance bus.
///
/// `occurred_at` is the producer-side timestamp and is the secondary sort key
/// when a delivery session flushes its resume buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            event_type,
            schema_version: SCHEMA_VERSION,
            occurred_at,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the payload into the typed event for this envelope's
    /// `event_type`. The caller picks `T` after matching on the type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Conversation the payload belongs to. This is the routing key for the
    /// dispatcher and the partition key on the event log.
    pub fn conversation_id(&self) -> Result<Uuid, EnvelopeError> {
        match self.event_type {
            EventType::MessageSent => {
                let event: MessageSentEvent = self.decode()?;
                Ok(event.message.conversation_id)
            }
            EventType::MessageDeleted => {
                let event: MessageDeletedEvent = self.decode()?;
                Ok(event.conversation_id)
            }
            EventType::ReadReceiptUpdated => {
                let event: ReadReceiptUpdatedEvent = self.decode()?;
                Ok(event.conversation_id)
            }
            EventType::MembershipChanged => {
                let event: MembershipChangedEvent = self.decode()?;
                Ok(event.conversation_id)
            }
            EventType::ConversationCreated => {
                let event: ConversationCreatedEvent = self.decode()?;
                Ok(event.conversation.conversation_id)
            }
            EventType::PresenceUpdated => Err(EnvelopeError::NoConversation(self.event_type)),
        }
    }

    /// Message sequence when the payload is a `message_sent` event, 0
    /// otherwise. Primary sort key for resume-buffer flushing.
    pub fn message_sequence(&self) -> i64 {
        if self.event_type != EventType::MessageSent {
            return 0;
        }
        self.decode::<MessageSentEvent>()
            .map(|event| event.message.sequence)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_record(sequence: i64) -> MessageRecord {
        MessageRecord {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_user_id: Uuid::new_v4(),
            sequence,
            message_type: "text".to_string(),
            content: "hello".to_string(),
            metadata: None,
            sent_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn envelope_round_trips_message_sent() {
        let message = message_record(7);
        let event = MessageSentEvent {
            message: message.clone(),
        };
        let env = EventEnvelope::new(EventType::MessageSent, Utc::now(), &event).unwrap();

        let bytes = env.to_bytes().unwrap();
        let decoded = EventEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.event_type, EventType::MessageSent);
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
        let inner: MessageSentEvent = decoded.decode().unwrap();
        assert_eq!(inner.message.message_id, message.message_id);
        assert_eq!(inner.message.sequence, 7);
    }

    #[test]
    fn envelope_round_trips_all_event_types() {
        let conversation_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let cases: Vec<(EventType, serde_json::Value)> = vec![
            (
                EventType::MessageSent,
                serde_json::to_value(MessageSentEvent {
                    message: message_record(1),
                })
                .unwrap(),
            ),
            (
                EventType::MessageDeleted,
                serde_json::to_value(MessageDeletedEvent {
                    conversation_id,
                    message_id: Uuid::new_v4(),
                })
                .unwrap(),
            ),
            (
                EventType::ReadReceiptUpdated,
                serde_json::to_value(ReadReceiptUpdatedEvent {
                    conversation_id,
                    user_id,
                    read_sequence: 12,
                })
                .unwrap(),
            ),
            (
                EventType::MembershipChanged,
                serde_json::to_value(MembershipChangedEvent {
                    conversation_id,
                    user_id,
                    added: true,
                })
                .unwrap(),
            ),
            (
                EventType::ConversationCreated,
                serde_json::to_value(ConversationCreatedEvent {
                    conversation: ConversationRecord {
                        conversation_id,
                        conversation_type: "group".to_string(),
                        display_name: "team".to_string(),
                        avatar_url: String::new(),
                        created_at: now,
                    },
                    participant_user_ids: vec![user_id],
                })
                .unwrap(),
            ),
            (
                EventType::PresenceUpdated,
                serde_json::to_value(PresenceUpdatedEvent {
                    user_id,
                    status: PresenceStatus::Online,
                    occurred_at: now,
                })
                .unwrap(),
            ),
        ];

        for (event_type, payload) in cases {
            let env = EventEnvelope {
                event_type,
                schema_version: SCHEMA_VERSION,
                occurred_at: now,
                payload,
            };
            let decoded = EventEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded.event_type, event_type);
            assert_eq!(
                serde_json::to_value(&decoded).unwrap(),
                serde_json::to_value(&env).unwrap()
            );
        }
    }

    #[test]
    fn conversation_id_dispatches_on_event_type() {
        let event = MessageDeletedEvent {
            conversation_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
        };
        let env = EventEnvelope::new(EventType::MessageDeleted, Utc::now(), &event).unwrap();
        assert_eq!(env.conversation_id().unwrap(), event.conversation_id);

        let presence = PresenceUpdatedEvent {
            user_id: Uuid::new_v4(),
            status: PresenceStatus::Offline,
            occurred_at: Utc::now(),
        };
        let env = EventEnvelope::new(EventType::PresenceUpdated, Utc::now(), &presence).unwrap();
        assert!(matches!(
            env.conversation_id(),
            Err(EnvelopeError::NoConversation(EventType::PresenceUpdated))
        ));
    }

    #[test]
    fn message_sequence_is_zero_for_non_message_events() {
        let event = ReadReceiptUpdatedEvent {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            read_sequence: 3,
        };
        let env = EventEnvelope::new(EventType::ReadReceiptUpdated, Utc::now(), &event).unwrap();
        assert_eq!(env.message_sequence(), 0);

        let sent = MessageSentEvent {
            message: message_record(42),
        };
        let env = EventEnvelope::new(EventType::MessageSent, Utc::now(), &sent).unwrap();
        assert_eq!(env.message_sequence(), 42);
    }

    #[test]
    fn event_type_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&EventType::ReadReceiptUpdated).unwrap();
        assert_eq!(json, "\"read_receipt_updated\"");
    }
}
