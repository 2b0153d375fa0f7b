use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Domain errors. Transport codes are assigned only at the boundary
/// (`status_code` / `ResponseError`); everything below the routes layer
/// passes these through unchanged.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidArgument(_) => 400,
            AppError::Unauthenticated => 401,
            AppError::PermissionDenied(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::FailedPrecondition(_) => 409,
            AppError::Unavailable(_) => 503,
            AppError::Timeout => 504,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal(_) => 500,
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = actix_web::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);

        // Internal detail stays in the logs, not on the wire.
        let message = match self {
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(status).json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }))
    }
}

impl From<event_schema::EnvelopeError> for AppError {
    fn from(e: event_schema::EnvelopeError) -> Self {
        AppError::Internal(format!("event envelope: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization: {e}"))
    }
}

impl From<transactional_outbox::OutboxError> for AppError {
    fn from(e: transactional_outbox::OutboxError) -> Self {
        match e {
            transactional_outbox::OutboxError::Database(db) => AppError::Database(db),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Unavailable(format!("redis: {e}"))
    }
}

/// Postgres aborts one of two conflicting transactions with SQLSTATE 40001
/// (serialization_failure) or 40P01 (deadlock_detected); both are safe to
/// retry from the top of the transaction.
pub fn is_serialization_conflict(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_transport_table() {
        assert_eq!(AppError::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(AppError::Unauthenticated.status_code(), 401);
        assert_eq!(AppError::PermissionDenied("x".into()).status_code(), 403);
        assert_eq!(AppError::NotFound("conversation").status_code(), 404);
        assert_eq!(AppError::FailedPrecondition("x".into()).status_code(), 409);
        assert_eq!(AppError::Unavailable("x".into()).status_code(), 503);
        assert_eq!(AppError::Timeout.status_code(), 504);
        assert_eq!(AppError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn non_database_errors_are_not_retryable() {
        assert!(!is_serialization_conflict(&sqlx::Error::RowNotFound));
    }
}
