use super::{with_deadline, LOOKUP_DEADLINE};
use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SessionBinding {
    pub user_id: Uuid,
    pub device_id: String,
}

#[post("/presence/sessions")]
pub async fn register_session(
    state: web::Data<AppState>,
    body: web::Json<SessionBinding>,
) -> AppResult<HttpResponse> {
    with_deadline(
        LOOKUP_DEADLINE,
        state.presence.register(body.user_id, &body.device_id),
    )
    .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/presence/sessions")]
pub async fn unregister_session(
    state: web::Data<AppState>,
    body: web::Json<SessionBinding>,
) -> AppResult<HttpResponse> {
    with_deadline(
        LOOKUP_DEADLINE,
        state.presence.unregister(body.user_id, &body.device_id),
    )
    .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/presence/sessions")]
pub async fn refresh_session(
    state: web::Data<AppState>,
    body: web::Json<SessionBinding>,
) -> AppResult<HttpResponse> {
    with_deadline(
        LOOKUP_DEADLINE,
        state.presence.refresh(body.user_id, &body.device_id),
    )
    .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/presence/users/{user_id}/devices")]
pub async fn get_user_devices(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let devices = with_deadline(
        LOOKUP_DEADLINE,
        state.presence.get_user_devices(path.into_inner()),
    )
    .await?;
    Ok(HttpResponse::Ok().json(devices))
}

#[get("/presence/users/{user_id}")]
pub async fn get_presence(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let online = with_deadline(
        LOOKUP_DEADLINE,
        state.presence.is_online(path.into_inner()),
    )
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "online": online })))
}
