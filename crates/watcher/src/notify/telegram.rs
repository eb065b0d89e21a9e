use super::format::Alert;
use super::{ChannelError, NotificationChannel};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct TelegramChannel {
    api_url: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            client,
        }
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_url, self.bot_token)
    }

    fn payload(&self, alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "chat_id": self.chat_id,
            "text": alert.to_html(),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.send_message_url())
            .json(&self.payload(alert))
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
        debug!(chat_id = %self.chat_id, "telegram alert sent");
        Ok(())
    }
}
