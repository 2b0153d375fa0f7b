use super::{with_deadline, LOOKUP_DEADLINE, SEND_DEADLINE};
use crate::error::AppResult;
use crate::models::Message;
use crate::services::message_service::SendMessageCommand;
use crate::state::AppState;
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_user_id: Uuid,
    pub idempotency_key: String,
    pub content: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[post("/conversations/{conversation_id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> AppResult<HttpResponse> {
    let conversation_id = path.into_inner();
    let req = body.into_inner();

    let message: Message = with_deadline(
        SEND_DEADLINE,
        state.messages.send_message(SendMessageCommand {
            conversation_id,
            sender_id: req.sender_user_id,
            idempotency_key: req.idempotency_key,
            message_type: req.message_type,
            content: req.content,
            metadata: req.metadata,
        }),
    )
    .await?;

    Ok(HttpResponse::Ok().json(message))
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub actor_user_id: Uuid,
}

#[delete("/conversations/{conversation_id}/messages/{message_id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
    query: web::Query<ActorQuery>,
) -> AppResult<HttpResponse> {
    let (conversation_id, message_id) = path.into_inner();

    with_deadline(
        LOOKUP_DEADLINE,
        state
            .messages
            .delete_message(conversation_id, message_id, query.actor_user_id),
    )
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub user_id: Uuid,
    #[serde(default)]
    pub after_sequence: i64,
    #[serde(default)]
    pub page_size: i64,
}

#[get("/conversations/{conversation_id}/messages")]
pub async fn sync_messages(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<SyncQuery>,
) -> AppResult<HttpResponse> {
    let conversation_id = path.into_inner();

    let messages = with_deadline(
        LOOKUP_DEADLINE,
        state.messages.sync_messages(
            conversation_id,
            query.user_id,
            query.after_sequence,
            query.page_size,
        ),
    )
    .await?;

    Ok(HttpResponse::Ok().json(messages))
}

#[derive(Debug, Deserialize)]
pub struct ReadReceiptRequest {
    pub user_id: Uuid,
    pub read_sequence: i64,
}

#[put("/conversations/{conversation_id}/read-receipt")]
pub async fn update_read_receipt(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ReadReceiptRequest>,
) -> AppResult<HttpResponse> {
    let conversation_id = path.into_inner();

    with_deadline(
        LOOKUP_DEADLINE,
        state
            .messages
            .update_read_receipt(conversation_id, body.user_id, body.read_sequence),
    )
    .await?;

    Ok(HttpResponse::NoContent().finish())
}
