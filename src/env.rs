use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::BrokerConfig;

/// Overlays `RABBITMQ_*` / `RPC_*` environment variables (and a `.env` file,
/// if present) onto `config`.
pub fn apply_env_overrides(config: &mut BrokerConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |key| env::var(key).ok())
}

pub fn apply_overrides_from<F>(config: &mut BrokerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("RABBITMQ_HOST") {
        config.connection.host = Some(host);
    }
    if let Some(port) = parsed(&lookup, "RABBITMQ_PORT")? {
        config.connection.port = port;
    }
    if let Some(vhost) = lookup("RABBITMQ_VHOST") {
        config.connection.vhost = vhost;
    }
    if let Some(user) = lookup("RABBITMQ_USER") {
        config.connection.username = user;
    }
    if let Some(password) = lookup("RABBITMQ_PASSWORD") {
        config.connection.password = password;
    }
    if let Some(prefetch) = parsed(&lookup, "RABBITMQ_PREFETCH_COUNT")? {
        config.channel.prefetch_count = prefetch;
    }
    if let Some(attempts) = parsed(&lookup, "RABBITMQ_MAX_RECONNECT_ATTEMPTS")? {
        config.reconnect.max_attempts = attempts;
    }
    if let Some(timeout) = parsed(&lookup, "RPC_TIMEOUT_MS")? {
        config.rpc.request_timeout_ms = timeout;
    }
    if let Some(source) = lookup("SERVICE_NAME") {
        config.source = source;
    }
    Ok(())
}

fn parsed<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .context(format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}
