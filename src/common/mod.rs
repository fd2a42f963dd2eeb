// Messaging core: transport seam, connection resilience, topology,
// event publishing and request/response.
pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod in_memory;
pub mod publisher;
pub mod request_response;
pub mod retry;
pub mod topology;
pub mod worker;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{BrokerChannel, BrokerConnector, LapinConnector, MessageProperties};
pub use channel_manager::ChannelConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{handler_fn, ConsumerId, IncomingMessage, MessageHandler};
pub use errors::{BrokerError, RpcError};
pub use in_memory::InMemoryBroker;
pub use publisher::{DomainEvent, EventPublisher};
pub use request_response::{PendingCall, PendingRequestStats, RequestResponseCoordinator};
pub use retry::RetryOptions;
pub use topology::{ExchangeKind, TopologyDeclaration};
pub use worker::{operation_fn, OperationHandler, Worker};
