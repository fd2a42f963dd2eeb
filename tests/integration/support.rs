use std::sync::Arc;
use std::time::Duration;

use rabbit_bus::common::{ConnectionManager, InMemoryBroker};
use rabbit_bus::config::BrokerConfig;

/// Single host, fast reconnects and short RPC deadlines.
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.connection.host = Some("localhost".to_string());
    config.connection.fallback_hosts = Vec::new();
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config.reconnect.max_attempts = 5;
    config.rpc.request_timeout_ms = 2_000;
    config.source = "integration-tests".to_string();
    config
}

pub fn connection(broker: &InMemoryBroker, config: &BrokerConfig) -> ConnectionManager {
    ConnectionManager::new(config, Arc::new(broker.connector()))
}

/// Polls `condition` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
