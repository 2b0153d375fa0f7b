//! JSON service surface consumed by the HTTP gateway and internal callers.
//! Authentication and rate limiting live at the gateway; requests arriving
//! here carry already-verified user ids.

pub mod conversations;
pub mod health;
pub mod messages;
pub mod presence;

use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(messages::send_message)
            .service(messages::delete_message)
            .service(messages::sync_messages)
            .service(messages::update_read_receipt)
            .service(conversations::create_conversation)
            .service(conversations::get_conversation)
            .service(conversations::list_conversations)
            .service(conversations::add_participant)
            .service(conversations::remove_participant)
            .service(presence::register_session)
            .service(presence::unregister_session)
            .service(presence::refresh_session)
            .service(presence::get_user_devices)
            .service(presence::get_presence),
    )
    .service(web::scope("/internal").service(conversations::next_sequence))
    .service(health::live)
    .service(health::ready)
    .route("/metrics", web::get().to(crate::metrics::metrics_handler));
}

/// Default deadline for multi-step writes (sends).
pub(crate) const SEND_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);
/// Default deadline for lookups and single-row mutations.
pub(crate) const LOOKUP_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

/// Deadline wrapper: a blown deadline surfaces as the timeout error kind.
pub(crate) async fn with_deadline<T>(
    deadline: std::time::Duration,
    fut: impl std::future::Future<Output = crate::error::AppResult<T>>,
) -> crate::error::AppResult<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(crate::error::AppError::Timeout),
    }
}
