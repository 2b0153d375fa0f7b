//! Conversation lifecycle and the per-conversation sequencer.
//!
//! Creation initializes the sequence counter in the same transaction as the
//! conversation row, so the send pipeline can always claim a number.
//! Direct conversations are deduplicated through a canonical lookup key over
//! the sorted participant pair; a create race resolves to the existing row
//! instead of surfacing a conflict.

use crate::delivery::MembershipSource;
use crate::error::{AppError, AppResult};
use crate::models::{direct_lookup_key, Conversation, ConversationType, Role};
use crate::repository::Repository;
use async_trait::async_trait;
use chrono::Utc;
use event_schema::{
    ConversationCreatedEvent, ConversationRecord, EventEnvelope, EventType,
    MembershipChangedEvent,
};
use sqlx::{Postgres, Transaction};
use transactional_outbox::OutboxRepository;
use uuid::Uuid;

/// Conversation events share the messaging aggregate so they land on the
/// same partition as the messages they interleave with.
const AGGREGATE_TYPE: &str = "message";

#[derive(Debug, Clone)]
pub struct CreateConversationCommand {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub display_name: String,
    pub avatar_url: String,
    /// For groups the first participant is the creator and becomes admin.
    pub participants: Vec<Uuid>,
}

pub struct ConversationService {
    repo: Repository,
    outbox: OutboxRepository,
}

impl ConversationService {
    pub fn new(repo: Repository, outbox: OutboxRepository) -> Self {
        Self { repo, outbox }
    }

    pub async fn create_conversation(
        &self,
        cmd: CreateConversationCommand,
    ) -> AppResult<Conversation> {
        if cmd.id.is_nil() {
            return Err(AppError::InvalidArgument("conversation id is required".into()));
        }
        if cmd.conversation_type == ConversationType::Direct && cmd.participants.len() != 2 {
            return Err(AppError::InvalidArgument(
                "direct conversation requires exactly two participants".into(),
            ));
        }
        if cmd.conversation_type == ConversationType::Group && cmd.participants.is_empty() {
            return Err(AppError::InvalidArgument(
                "group conversation requires at least one participant".into(),
            ));
        }

        let lookup_key = match cmd.conversation_type {
            ConversationType::Direct => {
                Some(direct_lookup_key(cmd.participants[0], cmd.participants[1]))
            }
            ConversationType::Group => None,
        };

        // Best-effort pre-transaction lookups, in parallel. Losing a race
        // here is fine; the in-transaction double check is authoritative.
        if let Some(existing) = self.parallel_lookup(cmd.id, lookup_key.as_deref()).await {
            return Ok(existing);
        }

        let mut tx = self.repo.pool().begin().await?;

        if let Ok(existing) = self.repo.get_conversation(cmd.id).await {
            tx.rollback().await?;
            return Ok(existing);
        }
        if let Some(key) = lookup_key.as_deref() {
            if let Ok(existing) = self.repo.get_conversation_by_lookup_key(key).await {
                tx.rollback().await?;
                return Ok(existing);
            }
        }

        match self.do_create(&mut tx, &cmd, lookup_key.as_deref()).await {
            Ok(conversation) => {
                tx.commit().await?;
                Ok(conversation)
            }
            Err(create_err) => {
                // A unique violation means a concurrent creator won; hand
                // back their row.
                tx.rollback().await?;
                if let Ok(existing) = self.repo.get_conversation(cmd.id).await {
                    return Ok(existing);
                }
                if let Some(key) = lookup_key.as_deref() {
                    if let Ok(existing) = self.repo.get_conversation_by_lookup_key(key).await {
                        return Ok(existing);
                    }
                }
                Err(create_err)
            }
        }
    }

    async fn parallel_lookup(
        &self,
        id: Uuid,
        lookup_key: Option<&str>,
    ) -> Option<Conversation> {
        match lookup_key {
            Some(key) => {
                let (by_id, by_key) = tokio::join!(
                    self.repo.get_conversation(id),
                    self.repo.get_conversation_by_lookup_key(key)
                );
                by_id.ok().or_else(|| by_key.ok())
            }
            None => self.repo.get_conversation(id).await.ok(),
        }
    }

    async fn do_create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        cmd: &CreateConversationCommand,
        lookup_key: Option<&str>,
    ) -> AppResult<Conversation> {
        self.repo
            .insert_conversation(
                tx,
                cmd.id,
                cmd.conversation_type,
                &cmd.display_name,
                &cmd.avatar_url,
                lookup_key,
            )
            .await?;

        self.repo.init_sequence(tx, cmd.id).await?;

        for (i, user_id) in cmd.participants.iter().enumerate() {
            let role = if cmd.conversation_type == ConversationType::Group && i == 0 {
                Role::Admin
            } else {
                Role::Member
            };
            self.repo.insert_participant(tx, cmd.id, *user_id, role).await?;
        }

        let conversation = self.repo.get_conversation_locked(tx, cmd.id).await?;

        let event = ConversationCreatedEvent {
            conversation: ConversationRecord {
                conversation_id: conversation.id,
                conversation_type: conversation.conversation_type.as_str().to_string(),
                display_name: conversation.display_name.clone(),
                avatar_url: conversation.avatar_url.clone(),
                created_at: conversation.created_at,
            },
            participant_user_ids: conversation.participant_ids(),
        };
        let envelope =
            EventEnvelope::new(EventType::ConversationCreated, conversation.created_at, &event)?;
        self.outbox
            .enqueue(
                tx,
                AGGREGATE_TYPE,
                conversation.id,
                EventType::ConversationCreated.as_str(),
                &serde_json::to_value(&envelope)?,
            )
            .await?;

        Ok(conversation)
    }

    /// Admin-only. Adding an existing participant is a no-op.
    pub async fn add_participant(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        target_id: Uuid,
    ) -> AppResult<()> {
        let mut tx = self.repo.pool().begin().await?;

        let conversation = self
            .repo
            .get_conversation_locked(&mut tx, conversation_id)
            .await?;

        if conversation.conversation_type != ConversationType::Group {
            return Err(AppError::FailedPrecondition(
                "direct conversations cannot be modified".into(),
            ));
        }
        if !conversation.is_admin(actor_id) {
            return Err(AppError::PermissionDenied("actor is not an admin".into()));
        }
        if conversation.participants.contains_key(&target_id) {
            tx.commit().await?;
            return Ok(());
        }

        self.repo
            .insert_participant(&mut tx, conversation_id, target_id, Role::Member)
            .await?;

        self.enqueue_membership_changed(&mut tx, conversation_id, target_id, true)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Admin-only. Removing an absent participant is a no-op; removing the
    /// last admin is refused.
    pub async fn remove_participant(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        target_id: Uuid,
    ) -> AppResult<()> {
        let mut tx = self.repo.pool().begin().await?;

        let conversation = self
            .repo
            .get_conversation_locked(&mut tx, conversation_id)
            .await?;

        if conversation.conversation_type != ConversationType::Group {
            return Err(AppError::FailedPrecondition(
                "direct conversations cannot be modified".into(),
            ));
        }
        if !conversation.is_admin(actor_id) {
            return Err(AppError::PermissionDenied("actor is not an admin".into()));
        }

        let target = match conversation.participants.get(&target_id) {
            Some(p) => p,
            None => {
                tx.commit().await?;
                return Ok(());
            }
        };

        if target.role == Role::Admin && conversation.admin_count() <= 1 {
            return Err(AppError::FailedPrecondition(
                "cannot remove the last admin".into(),
            ));
        }

        self.repo
            .delete_participant(&mut tx, conversation_id, target_id)
            .await?;

        self.enqueue_membership_changed(&mut tx, conversation_id, target_id, false)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        self.repo.get_conversation(conversation_id).await
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        self.repo.list_conversations_by_user(user_id).await
    }

    /// Atomic claim of the next message sequence for a conversation.
    /// Internal: callers are the send pipeline and trusted services only.
    pub async fn next_sequence(&self, conversation_id: Uuid) -> AppResult<i64> {
        let mut tx = self.repo.pool().begin().await?;
        let sequence = self.repo.next_sequence(&mut tx, conversation_id).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    /// Participant ids only; the dispatcher's membership-cache refill path.
    pub async fn conversation_member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .repo
            .get_conversation(conversation_id)
            .await?
            .participant_ids())
    }

    async fn enqueue_membership_changed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
        added: bool,
    ) -> AppResult<()> {
        let event = MembershipChangedEvent {
            conversation_id,
            user_id,
            added,
        };
        let envelope = EventEnvelope::new(EventType::MembershipChanged, Utc::now(), &event)?;
        self.outbox
            .enqueue(
                tx,
                AGGREGATE_TYPE,
                conversation_id,
                EventType::MembershipChanged.as_str(),
                &serde_json::to_value(&envelope)?,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipSource for ConversationService {
    async fn conversation_members(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.conversation_member_ids(conversation_id).await
    }
}
