use crate::config::Config;
use crate::presence::Presence;
use crate::services::{ConversationService, MessageService};
use crate::session::Registry;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: ConnectionManager,
    pub config: Arc<Config>,
    pub messages: Arc<MessageService>,
    pub conversations: Arc<ConversationService>,
    pub presence: Arc<Presence>,
    pub registry: Arc<Registry>,
}
