use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use event_schema::MessageRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on message content, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 5000;

/// A persisted chat message.
///
/// Invariants:
/// 1. `sequence` is strictly increasing, gapless and unique per
///    conversation; it is the value the sequencer returned inside the same
///    transaction that inserted the row.
/// 2. All fields are immutable after commit except `deleted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sequence: i64,
    pub message_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        sequence: i64,
        message_type: &str,
        content: String,
        metadata: Option<serde_json::Value>,
        sent_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        if id.is_nil() || conversation_id.is_nil() || sender_id.is_nil() {
            return Err(AppError::InvalidArgument("empty identifier".into()));
        }
        if sequence <= 0 {
            return Err(AppError::InvalidArgument(format!(
                "invalid sequence {sequence}"
            )));
        }
        if content.len() > MAX_MESSAGE_SIZE {
            return Err(AppError::InvalidArgument(format!(
                "content exceeds {MAX_MESSAGE_SIZE} bytes"
            )));
        }

        let message_type = if message_type.is_empty() {
            "text".to_string()
        } else {
            message_type.to_string()
        };

        Ok(Self {
            id,
            conversation_id,
            sender_id,
            sequence,
            message_type,
            content,
            metadata,
            sent_at,
            deleted_at: None,
        })
    }

    /// Wire shape used by events and the resume replay path.
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            message_id: self.id,
            conversation_id: self.conversation_id,
            sender_user_id: self.sender_id,
            sequence: self.sequence,
            message_type: self.message_type.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            sent_at: self.sent_at,
            deleted_at: self.deleted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_new(sequence: i64, content: String) -> AppResult<Message> {
        Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            sequence,
            "text",
            content,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn content_at_limit_is_accepted() {
        let msg = try_new(1, "a".repeat(MAX_MESSAGE_SIZE)).unwrap();
        assert_eq!(msg.content.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn content_over_limit_is_invalid_argument() {
        let err = try_new(1, "a".repeat(MAX_MESSAGE_SIZE + 1)).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn limit_counts_bytes_not_characters() {
        // 1667 three-byte characters = 5001 bytes.
        let err = try_new(1, "€".repeat(1667)).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn non_positive_sequence_is_rejected() {
        assert!(try_new(0, "hi".into()).is_err());
        assert!(try_new(-3, "hi".into()).is_err());
    }

    #[test]
    fn nil_ids_are_rejected() {
        let err = Message::new(
            Uuid::nil(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            "text",
            "hi".into(),
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn empty_type_defaults_to_text() {
        let msg = Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            "",
            "hi".into(),
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(msg.message_type, "text");
    }
}
