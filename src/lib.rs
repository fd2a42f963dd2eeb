pub mod common;
pub mod config;
pub mod env;
pub mod message;

pub use common::{ConnectionManager, EventPublisher, RequestResponseCoordinator, Worker};
pub use config::BrokerConfig;
