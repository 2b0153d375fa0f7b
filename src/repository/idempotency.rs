use super::Repository;
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

impl Repository {
    /// Claim ownership of a send attempt. Returns true only when this call
    /// inserted the row; `ON CONFLICT DO NOTHING` reports a duplicate as
    /// zero affected rows.
    pub async fn try_insert_idempotency(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        user_id: Uuid,
        conversation_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, user_id, conversation_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key, user_id, conversation_id) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(user_id)
        .bind(conversation_id)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stored response for an existing key, locked for the rest of the
    /// transaction. NULL payload means the original owner crashed before
    /// commit; the caller takes ownership and overwrites on success.
    pub async fn get_idempotency_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT payload
            FROM idempotency_keys
            WHERE key = $1 AND user_id = $2 AND conversation_id = $3
            FOR UPDATE
            "#,
        )
        .bind(key)
        .bind(user_id)
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("payload")?),
            None => Ok(None),
        }
    }

    pub async fn update_idempotency_response(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        user_id: Uuid,
        conversation_id: Uuid,
        payload: &serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET payload = $4
            WHERE key = $1 AND user_id = $2 AND conversation_id = $3
            "#,
        )
        .bind(key)
        .bind(user_id)
        .bind(conversation_id)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
