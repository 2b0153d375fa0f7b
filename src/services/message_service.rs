//! Message write path: idempotent send, soft delete, read receipts and
//! history sync. Every mutation commits its state change and its outbox
//! event in one transaction.

use crate::error::{is_serialization_conflict, AppError, AppResult};
use crate::models::Message;
use crate::repository::Repository;
use chrono::{Duration as ChronoDuration, Utc};
use event_schema::{
    EventEnvelope, EventType, MessageDeletedEvent, MessageSentEvent, ReadReceiptUpdatedEvent,
};
use sqlx::{Postgres, Transaction};
use transactional_outbox::OutboxRepository;
use uuid::Uuid;

/// Aggregate type recorded on every messaging outbox row.
const AGGREGATE_TYPE: &str = "message";

/// How long a (key, sender, conversation) triple absorbs retries.
const IDEMPOTENCY_TTL_HOURS: i64 = 24;

/// Attempts for a send transaction that keeps losing serialization races.
const MAX_TX_ATTEMPTS: u32 = 5;

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone)]
pub struct SendMessageCommand {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub idempotency_key: String,
    pub message_type: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

pub struct MessageService {
    repo: Repository,
    outbox: OutboxRepository,
}

impl MessageService {
    pub fn new(repo: Repository, outbox: OutboxRepository) -> Self {
        Self { repo, outbox }
    }

    /// Idempotent send. Retries with the same (key, sender, conversation)
    /// triple return the cached response without side effects.
    pub async fn send_message(&self, cmd: SendMessageCommand) -> AppResult<Message> {
        if cmd.idempotency_key.is_empty() {
            return Err(AppError::InvalidArgument("idempotency_key is required".into()));
        }

        let mut attempt = 0;
        loop {
            match self.try_send(&cmd).await {
                Err(AppError::Database(e))
                    if is_serialization_conflict(&e) && attempt + 1 < MAX_TX_ATTEMPTS =>
                {
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        conversation_id = %cmd.conversation_id,
                        "send transaction lost a serialization race, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_send(&self, cmd: &SendMessageCommand) -> AppResult<Message> {
        let mut tx = self.repo.pool().begin().await?;

        let owned = self
            .repo
            .try_insert_idempotency(
                &mut tx,
                &cmd.idempotency_key,
                cmd.sender_id,
                cmd.conversation_id,
                Utc::now() + ChronoDuration::hours(IDEMPOTENCY_TTL_HOURS),
            )
            .await?;

        if !owned {
            if let Some(payload) = self
                .repo
                .get_idempotency_for_update(
                    &mut tx,
                    &cmd.idempotency_key,
                    cmd.sender_id,
                    cmd.conversation_id,
                )
                .await?
            {
                let cached: Message = serde_json::from_value(payload)?;
                tx.commit().await?;
                return Ok(cached);
            }
            // Row exists with NULL payload: the previous owner crashed
            // mid-transaction. The FOR UPDATE lock above makes this attempt
            // the new owner; fall through and overwrite on success.
        }

        // Read-only membership check; the sequence counter's row lock is
        // what serializes concurrent senders, not the conversation row.
        let conversation = self.repo.get_conversation(cmd.conversation_id).await?;
        conversation.can_send(cmd.sender_id)?;

        let sequence = self.repo.next_sequence(&mut tx, cmd.conversation_id).await?;

        let message = Message::new(
            Uuid::new_v4(),
            cmd.conversation_id,
            cmd.sender_id,
            sequence,
            &cmd.message_type,
            cmd.content.clone(),
            cmd.metadata.clone(),
            Utc::now(),
        )?;

        self.repo.insert_message(&mut tx, &message).await?;
        self.repo
            .touch_conversation(&mut tx, cmd.conversation_id, message.sent_at)
            .await?;

        let event = MessageSentEvent {
            message: message.to_record(),
        };
        self.enqueue_event(&mut tx, cmd.conversation_id, EventType::MessageSent, &event)
            .await?;

        let response = serde_json::to_value(&message)?;
        self.repo
            .update_idempotency_response(
                &mut tx,
                &cmd.idempotency_key,
                cmd.sender_id,
                cmd.conversation_id,
                &response,
            )
            .await?;

        tx.commit().await?;
        crate::metrics::MESSAGES_SENT_TOTAL.inc();
        Ok(message)
    }

    /// Soft delete. Allowed for the original sender or any conversation
    /// admin; a second delete of the same message is a no-op.
    pub async fn delete_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        actor_id: Uuid,
    ) -> AppResult<()> {
        let mut tx = self.repo.pool().begin().await?;

        let message = self.repo.get_message_for_update(&mut tx, message_id).await?;
        if message.conversation_id != conversation_id {
            return Err(AppError::InvalidArgument(
                "message does not belong to this conversation".into(),
            ));
        }

        if message.sender_id != actor_id {
            let conversation = self.repo.get_conversation(conversation_id).await?;
            if !conversation.is_admin(actor_id) {
                return Err(AppError::PermissionDenied(
                    "only the sender or an admin can delete a message".into(),
                ));
            }
        }

        if message.deleted_at.is_some() {
            tx.commit().await?;
            return Ok(());
        }

        self.repo
            .mark_message_deleted(&mut tx, message_id, Utc::now())
            .await?;

        let event = MessageDeletedEvent {
            conversation_id,
            message_id,
        };
        self.enqueue_event(&mut tx, conversation_id, EventType::MessageDeleted, &event)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Raise a participant's read cursor, clamped to the highest sequence
    /// the conversation has actually handed out.
    pub async fn update_read_receipt(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        read_sequence: i64,
    ) -> AppResult<()> {
        let mut tx = self.repo.pool().begin().await?;

        let max_sequence = self
            .repo
            .current_max_sequence(&mut tx, conversation_id)
            .await?;
        let clamped = read_sequence.min(max_sequence);

        self.repo
            .update_last_read_sequence(&mut tx, conversation_id, user_id, clamped)
            .await?;

        let event = ReadReceiptUpdatedEvent {
            conversation_id,
            user_id,
            read_sequence: clamped,
        };
        self.enqueue_event(&mut tx, conversation_id, EventType::ReadReceiptUpdated, &event)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Ordered page of history after `after_sequence`. Requester must be a
    /// participant.
    pub async fn sync_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        after_sequence: i64,
        page_size: i64,
    ) -> AppResult<Vec<Message>> {
        let page_size = normalize_page_size(page_size);

        let conversation = self.repo.get_conversation(conversation_id).await?;
        conversation.can_send(user_id)?;

        self.repo
            .fetch_messages(conversation_id, after_sequence, page_size)
            .await
    }

    async fn enqueue_event<T: serde::Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        event_type: EventType,
        event: &T,
    ) -> AppResult<()> {
        let envelope = EventEnvelope::new(event_type, Utc::now(), event)?;
        let payload = serde_json::to_value(&envelope)?;
        self.outbox
            .enqueue(tx, AGGREGATE_TYPE, conversation_id, event_type.as_str(), &payload)
            .await?;
        Ok(())
    }
}

fn normalize_page_size(page_size: i64) -> i64 {
    if page_size <= 0 || page_size > MAX_PAGE_SIZE {
        DEFAULT_PAGE_SIZE
    } else {
        page_size
    }
}
