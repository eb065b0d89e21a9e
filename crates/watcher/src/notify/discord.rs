use super::format::Alert;
use super::{ChannelError, NotificationChannel};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Discord rejects webhook content longer than this.
const MAX_CONTENT_CHARS: usize = 2000;

pub struct DiscordChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(webhook_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            webhook_url: webhook_url.to_string(),
            client,
        }
    }
}

fn content(alert: &Alert) -> String {
    let text = alert.to_markdown();
    if text.chars().count() <= MAX_CONTENT_CHARS {
        return text;
    }
    text.chars().take(MAX_CONTENT_CHARS - 1).chain(['…']).collect()
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": content(alert) }))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!("discord alert sent");
        Ok(())
    }
}
