use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::BrokerError;
use crate::config::ChannelSettings;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID prefix)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_settings(&ChannelSettings::default())
    }
}

impl ChannelConfig {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            prefetch_count: settings.prefetch_count,
            confirm_mode: settings.confirm_mode,
            id: format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

/// Applies QoS and confirm mode to a freshly opened channel.
pub async fn configure_channel(channel: &Channel, config: &ChannelConfig) -> Result<(), BrokerError> {
    if config.prefetch_count > 0 {
        debug!(channel_id = %config.id, "Setting channel QoS to {}", config.prefetch_count);
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to set QoS: {}", e)))?;
    }

    if config.confirm_mode {
        debug!(channel_id = %config.id, "Enabling confirm mode");
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                BrokerError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;
    }

    info!(
        channel_id = %config.id,
        prefetch = config.prefetch_count,
        confirm = config.confirm_mode,
        "Channel configured"
    );
    Ok(())
}
