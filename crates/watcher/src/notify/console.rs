use super::format::Alert;
use super::{ChannelError, NotificationChannel};
use async_trait::async_trait;
use tracing::info;

/// Writes the plain-text alert to the log stream.
pub struct ConsoleChannel;

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        info!(token = %alert.token_address, whales = alert.whales.len(), "{}", alert.to_plain());
        Ok(())
    }
}
