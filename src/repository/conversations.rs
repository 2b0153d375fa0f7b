use super::Repository;
use crate::error::{AppError, AppResult};
use crate::models::{Conversation, ConversationType, Participant, Role};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

fn row_to_conversation_head(
    row: &sqlx::postgres::PgRow,
) -> Result<(Uuid, String, String, String, DateTime<Utc>), sqlx::Error> {
    Ok((
        row.try_get("id")?,
        row.try_get("type")?,
        row.try_get("display_name")?,
        row.try_get("avatar_url")?,
        row.try_get("created_at")?,
    ))
}

impl Repository {
    pub async fn insert_conversation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        conversation_type: ConversationType,
        display_name: &str,
        avatar_url: &str,
        lookup_key: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, type, display_name, avatar_url, lookup_key)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(conversation_type.as_str())
        .bind(display_name)
        .bind(avatar_url)
        .bind(lookup_key)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Counter starts at 0; [`Repository::next_sequence`] increments before
    /// returning, so the first message gets sequence 1.
    pub async fn init_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO conversation_sequences (conversation_id, next_sequence) VALUES ($1, 0)",
        )
        .bind(conversation_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Atomic claim of the next message sequence. The row lock taken by the
    /// UPDATE is what serializes concurrent senders of one conversation.
    pub async fn next_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
    ) -> AppResult<i64> {
        let row = sqlx::query(
            r#"
            UPDATE conversation_sequences
            SET next_sequence = next_sequence + 1
            WHERE conversation_id = $1
            RETURNING next_sequence
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("conversation sequence"))?;

        Ok(row.try_get("next_sequence")?)
    }

    /// Highest sequence handed out so far (0 for a fresh conversation).
    pub async fn current_max_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
    ) -> AppResult<i64> {
        let row = sqlx::query(
            "SELECT next_sequence FROM conversation_sequences WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => {
                let next: i64 = row.try_get("next_sequence")?;
                Ok(next)
            }
            None => Ok(0),
        }
    }

    pub async fn insert_participant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, role)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn delete_participant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Raise-only update of a participant's read cursor.
    pub async fn update_last_read_sequence(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
        sequence: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET last_read_sequence = GREATEST(last_read_sequence, $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(sequence)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Keeps conversation listings ordered by activity.
    pub async fn touch_conversation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query(
            "SELECT id, type, display_name, avatar_url, created_at FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;

        let participants = self.fetch_participants(conversation_id).await?;
        Self::assemble(&row, participants)
    }

    /// Row-locked aggregate read; used before membership mutations.
    pub async fn get_conversation_locked(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
    ) -> AppResult<Conversation> {
        let row = sqlx::query(
            r#"
            SELECT id, type, display_name, avatar_url, created_at
            FROM conversations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;

        let rows = sqlx::query(
            r#"
            SELECT user_id, role, last_read_sequence
            FROM conversation_participants
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut participants = HashMap::new();
        for p in &rows {
            let participant = Self::row_to_participant(p)?;
            participants.insert(participant.user_id, participant);
        }
        Self::assemble(&row, participants)
    }

    pub async fn get_conversation_by_lookup_key(
        &self,
        lookup_key: &str,
    ) -> AppResult<Conversation> {
        let row = sqlx::query("SELECT id FROM conversations WHERE lookup_key = $1")
            .bind(lookup_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;

        let id: Uuid = row.try_get("id")?;
        self.get_conversation(id).await
    }

    pub async fn list_conversations_by_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.type, c.display_name, c.avatar_url, c.created_at
            FROM conversations c
            JOIN conversation_participants cp ON c.id = cp.conversation_id
            WHERE cp.user_id = $1
            ORDER BY c.updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let participants = self.fetch_participants(id).await?;
            out.push(Self::assemble(row, participants)?);
        }
        Ok(out)
    }

    async fn fetch_participants(
        &self,
        conversation_id: Uuid,
    ) -> AppResult<HashMap<Uuid, Participant>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, role, last_read_sequence
            FROM conversation_participants
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut participants = HashMap::new();
        for row in &rows {
            let participant = Self::row_to_participant(row)?;
            participants.insert(participant.user_id, participant);
        }
        Ok(participants)
    }

    fn row_to_participant(row: &sqlx::postgres::PgRow) -> AppResult<Participant> {
        let role: String = row.try_get("role")?;
        Ok(Participant {
            user_id: row.try_get("user_id")?,
            role: Role::parse(&role)?,
            last_read_sequence: row.try_get("last_read_sequence")?,
        })
    }

    fn assemble(
        row: &sqlx::postgres::PgRow,
        participants: HashMap<Uuid, Participant>,
    ) -> AppResult<Conversation> {
        let (id, conversation_type, display_name, avatar_url, created_at) =
            row_to_conversation_head(row)?;
        Ok(Conversation {
            id,
            conversation_type: ConversationType::parse(&conversation_type)?,
            display_name,
            avatar_url,
            created_at,
            participants,
        })
    }
}
