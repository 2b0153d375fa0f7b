//! Real-time message delivery fabric for the chat backend.
//!
//! One service instance runs the send pipeline, the transactional-outbox
//! publisher, the event-log dispatcher, the presence facility and the
//! per-device WebSocket sessions. Instances are stateless apart from their
//! live sessions; cross-instance routing goes through the presence map and
//! the Redis delivery bus.

pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod repository;
pub mod routes;
pub mod services;
pub mod session;
pub mod state;
