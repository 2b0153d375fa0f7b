pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("outbox payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("outbox event {0} not found")]
    EventNotFound(i64),
}
