use super::{with_deadline, LOOKUP_DEADLINE, SEND_DEADLINE};
use crate::error::AppResult;
use crate::models::ConversationType;
use crate::services::conversation_service::CreateConversationCommand;
use crate::state::AppState;
use actix_web::{delete, get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// Client-generated id; creating the same id twice returns the
    /// existing conversation.
    pub conversation_id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
    pub participant_user_ids: Vec<Uuid>,
}

#[post("/conversations")]
pub async fn create_conversation(
    state: web::Data<AppState>,
    body: web::Json<CreateConversationRequest>,
) -> AppResult<HttpResponse> {
    let req = body.into_inner();

    let conversation = with_deadline(
        SEND_DEADLINE,
        state.conversations.create_conversation(CreateConversationCommand {
            id: req.conversation_id,
            conversation_type: req.conversation_type,
            display_name: req.display_name,
            avatar_url: req.avatar_url,
            participants: req.participant_user_ids,
        }),
    )
    .await?;

    Ok(HttpResponse::Ok().json(conversation))
}

#[get("/conversations/{conversation_id}")]
pub async fn get_conversation(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let conversation = with_deadline(
        LOOKUP_DEADLINE,
        state.conversations.get_conversation(path.into_inner()),
    )
    .await?;

    Ok(HttpResponse::Ok().json(conversation))
}

#[get("/users/{user_id}/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let conversations = with_deadline(
        LOOKUP_DEADLINE,
        state.conversations.list_conversations(path.into_inner()),
    )
    .await?;

    Ok(HttpResponse::Ok().json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantRequest {
    pub actor_user_id: Uuid,
    pub user_id: Uuid,
}

#[post("/conversations/{conversation_id}/participants")]
pub async fn add_participant(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<AddParticipantRequest>,
) -> AppResult<HttpResponse> {
    with_deadline(
        LOOKUP_DEADLINE,
        state
            .conversations
            .add_participant(path.into_inner(), body.actor_user_id, body.user_id),
    )
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub actor_user_id: Uuid,
}

#[delete("/conversations/{conversation_id}/participants/{user_id}")]
pub async fn remove_participant(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
    query: web::Query<ActorQuery>,
) -> AppResult<HttpResponse> {
    let (conversation_id, user_id) = path.into_inner();

    with_deadline(
        LOOKUP_DEADLINE,
        state
            .conversations
            .remove_participant(conversation_id, query.actor_user_id, user_id),
    )
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

/// Internal sequencer endpoint; untrusted callers are filtered at the
/// network layer.
#[post("/conversations/{conversation_id}/next-sequence")]
pub async fn next_sequence(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let sequence = with_deadline(
        LOOKUP_DEADLINE,
        state.conversations.next_sequence(path.into_inner()),
    )
    .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "sequence": sequence })))
}
