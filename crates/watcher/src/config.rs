use anyhow::{Context, Result};
use common::types::SignalRule;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub feed: FeedConfig,
    pub helius: HeliusConfig,
    pub registry: RegistryConfig,
    pub pipeline: PipelineConfig,
    pub signal_rule: SignalRule,
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub ws_url: String,
    pub commitment: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed attempts before giving up; unset retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub subscribe_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// No frame at all for this long (pongs included) drops the session.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl FeedConfig {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeliusConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_tasks: usize,
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub channel_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub console: bool,
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
    #[serde(default)]
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub dexscreener_url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dexscreener_url: "https://api.dexscreener.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub prometheus_port: u16,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

impl WatcherConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: WatcherConfig =
            toml::from_str(content).context("failed to parse watcher config")?;
        config.validate()?;
        Ok(config)
    }

    /// Fill empty secrets from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.helius.api_key.is_empty() {
            if let Some(key) = lookup("HELIUS_API_KEY") {
                self.helius.api_key = key;
            }
        }
        if let Some(tg) = self.notifications.telegram.as_mut() {
            if tg.bot_token.is_empty() {
                if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
                    tg.bot_token = token;
                }
            }
        }
        if let Some(dc) = self.notifications.discord.as_mut() {
            if dc.webhook_url.is_empty() {
                if let Some(url) = lookup("DISCORD_WEBHOOK_URL") {
                    dc.webhook_url = url;
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.port > 0, "server.port must be > 0");
        anyhow::ensure!(
            self.feed.ws_url.starts_with("ws://") || self.feed.ws_url.starts_with("wss://"),
            "feed.ws_url must be a ws:// or wss:// URL"
        );
        anyhow::ensure!(
            self.feed.backoff_initial_ms > 0
                && self.feed.backoff_initial_ms <= self.feed.backoff_max_ms,
            "feed.backoff_initial_ms must be in (0, backoff_max_ms]"
        );
        anyhow::ensure!(
            self.feed.connect_timeout_secs > 0,
            "feed.connect_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.feed.ping_interval_secs > 0
                && self.feed.ping_interval_secs < self.feed.idle_timeout_secs,
            "feed.ping_interval_secs must be in (0, idle_timeout_secs)"
        );
        anyhow::ensure!(
            self.feed.queue_capacity > 0,
            "feed.queue_capacity must be > 0"
        );
        anyhow::ensure!(
            self.helius.fetch_attempts > 0,
            "helius.fetch_attempts must be > 0"
        );
        anyhow::ensure!(
            self.pipeline.max_concurrent_tasks > 0,
            "pipeline.max_concurrent_tasks must be > 0"
        );
        anyhow::ensure!(
            self.signal_rule.min_whales > 0,
            "signal_rule.min_whales must be > 0"
        );
        anyhow::ensure!(
            self.signal_rule.time_window_hours > 0.0,
            "signal_rule.time_window_hours must be > 0"
        );
        anyhow::ensure!(
            self.signal_rule.min_total_sol >= 0.0,
            "signal_rule.min_total_sol must be >= 0"
        );
        Ok(())
    }

    pub fn default_config_path() -> String {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(std::path::Path::to_path_buf));

        if let Some(dir) = &exe_dir {
            let candidate = dir.join("watcher.toml");
            if candidate.exists() {
                return candidate.to_string_lossy().to_string();
            }
        }

        let candidate = Path::new("config/watcher.toml");
        if candidate.exists() {
            return candidate.to_string_lossy().to_string();
        }

        let candidate = Path::new("crates/watcher/config/watcher.toml");
        if candidate.exists() {
            return candidate.to_string_lossy().to_string();
        }

        "config/watcher.toml".to_string()
    }
}
