pub mod consumer;
pub mod dispatcher;
pub mod membership;
pub mod router;

pub use consumer::EventLogConsumer;
pub use dispatcher::{Dispatcher, InstanceBus, MembershipSource, PresenceLookup};
pub use membership::MembershipCache;
pub use router::Router;
