pub mod console;
pub mod discord;
pub mod format;
pub mod telegram;

use crate::config::NotificationsConfig;
use async_trait::async_trait;
use format::Alert;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("channel returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One outbound alert destination. Each channel renders the alert in its own format.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

/// Fans an alert out to every configured channel concurrently.
///
/// Each channel runs under its own timeout; a slow or failing channel never
/// delays or cancels the others. There is no retry.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    pub fn from_config(config: &NotificationsConfig) -> Self {
        let timeout = Duration::from_secs(config.channel_timeout_secs);
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

        if config.console {
            channels.push(Arc::new(console::ConsoleChannel));
        }
        if let Some(tg) = &config.telegram {
            if tg.bot_token.is_empty() {
                warn!("telegram configured without bot token, channel disabled");
            } else {
                channels.push(Arc::new(telegram::TelegramChannel::new(
                    &tg.api_url,
                    &tg.bot_token,
                    &tg.chat_id,
                    timeout,
                )));
            }
        }
        if let Some(dc) = &config.discord {
            if dc.webhook_url.is_empty() {
                warn!("discord configured without webhook url, channel disabled");
            } else {
                channels.push(Arc::new(discord::DiscordChannel::new(
                    &dc.webhook_url,
                    timeout,
                )));
            }
        }

        info!(
            channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "notification channels configured"
        );
        Self::new(channels, timeout)
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let sends = self.channels.iter().map(|channel| async move {
            let outcome = match tokio::time::timeout(self.timeout, channel.send(alert)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(self.timeout)),
            };
            (channel.name(), outcome)
        });

        let mut report = DispatchReport::default();
        for (name, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    metrics::counter!("watcher_dispatch_failures_total", "channel" => name)
                        .increment(1);
                    warn!(channel = name, token = %alert.token_address, error = %e, "notification failed");
                    report.failed.push(name);
                }
            }
        }
        report
    }
}
