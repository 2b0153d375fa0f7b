use super::Repository;
use crate::error::{AppError, AppResult};
use crate::models::Message;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        sequence: row.try_get("sequence")?,
        message_type: row.try_get("type")?,
        content: row.try_get("content")?,
        metadata: row.try_get("metadata")?,
        sent_at: row.try_get("sent_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, sequence, type, content, metadata, sent_at, deleted_at";

impl Repository {
    pub async fn insert_message(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: &Message,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, sequence, type, content, metadata, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(msg.id)
        .bind(msg.conversation_id)
        .bind(msg.sender_id)
        .bind(msg.sequence)
        .bind(&msg.message_type)
        .bind(&msg.content)
        .bind(&msg.metadata)
        .bind(msg.sent_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Messages after `after_sequence`, ascending, tombstones included.
    pub async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#
        ))
        .bind(conversation_id)
        .bind(after_sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_message(row).map_err(AppError::from))
            .collect()
    }

    /// Row-locked read; used before the soft-delete mutation.
    pub async fn get_message_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_id: Uuid,
    ) -> AppResult<Message> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE"
        ))
        .bind(message_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("message"))?;

        Ok(row_to_message(&row)?)
    }

    pub async fn mark_message_deleted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE messages SET deleted_at = $2 WHERE id = $1")
            .bind(message_id)
            .bind(deleted_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
