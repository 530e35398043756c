// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and collects API secrets from the environment
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub addons: AddonsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwitchConfig {
    /// Channel whose chat the bot joins
    #[serde(default)]
    pub channel: String,
    /// Login of the bot account
    #[serde(default)]
    pub bot_nick: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_probe_message")]
    pub probe_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonsConfig {
    #[serde(default = "default_addons_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_burst")]
    pub burst: usize,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Seconds to wait for event subscriptions at startup; 0 waits forever
    #[serde(default = "default_subscription_timeout_secs")]
    pub subscription_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_logs_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter port; absent disables the exporter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_prefix() -> String {
    "!".to_string()
}

fn default_probe_message() -> String {
    "squawk online".to_string()
}

fn default_addons_dir() -> String {
    "addons".to_string()
}

fn default_rate_burst() -> usize {
    20
}

fn default_rate_window_secs() -> u64 {
    30
}

fn default_poll_secs() -> u64 {
    30
}

fn default_subscription_timeout_secs() -> u64 {
    60
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            probe_message: default_probe_message(),
        }
    }
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            dir: default_addons_dir(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_rate_burst(),
            window_secs: default_rate_window_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            subscription_timeout_secs: default_subscription_timeout_secs(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: default_logs_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            toml::from_str::<Config>("")?
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("SQUAWK_CHANNEL") {
            config.twitch.channel = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_BOT_NICK") {
            config.twitch.bot_nick = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_PREFIX") {
            config.chat.prefix = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_PROBE_MESSAGE") {
            config.chat.probe_message = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_ADDONS_DIR") {
            config.addons.dir = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_RATE_BURST") {
            config.rate_limit.burst = val
                .parse()
                .with_context(|| format!("SQUAWK_RATE_BURST must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("SQUAWK_RATE_WINDOW_SECS") {
            config.rate_limit.window_secs = val.parse().with_context(|| {
                format!("SQUAWK_RATE_WINDOW_SECS must be a number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("SQUAWK_POLL_SECS") {
            config.session.poll_secs = val
                .parse()
                .with_context(|| format!("SQUAWK_POLL_SECS must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("SQUAWK_SUBSCRIPTION_TIMEOUT_SECS") {
            config.startup.subscription_timeout_secs = val.parse().with_context(|| {
                format!(
                    "SQUAWK_SUBSCRIPTION_TIMEOUT_SECS must be a number, got: {}",
                    val
                )
            })?;
        }
        if let Ok(val) = std::env::var("SQUAWK_LOGS_DIR") {
            config.logs.dir = val;
        }
        if let Ok(val) = std::env::var("SQUAWK_METRICS_PORT") {
            config.metrics.port = Some(
                val.parse()
                    .with_context(|| format!("SQUAWK_METRICS_PORT must be a port, got: {}", val))?,
            );
        }

        // Validate required fields
        if config.twitch.channel.trim().is_empty() {
            anyhow::bail!(
                "twitch.channel is required (set in config.toml or SQUAWK_CHANNEL env var)"
            );
        }
        if config.twitch.bot_nick.trim().is_empty() {
            anyhow::bail!(
                "twitch.bot_nick is required (set in config.toml or SQUAWK_BOT_NICK env var)"
            );
        }
        if config.chat.prefix.is_empty() {
            anyhow::bail!("chat.prefix must not be empty");
        }
        if config.rate_limit.burst == 0 {
            anyhow::bail!("rate_limit.burst must be at least 1");
        }
        if config.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be at least 1");
        }
        if config.session.poll_secs == 0 {
            anyhow::bail!("session.poll_secs must be at least 1");
        }

        Ok(config)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.session.poll_secs)
    }

    /// Startup subscription wait; `None` means wait forever
    pub fn subscription_timeout(&self) -> Option<Duration> {
        match self.startup.subscription_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// API credentials, read only from the environment (or .env via dotenvy).
/// These never appear in config.toml.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub client_id: String,
    pub client_secret: String,
    pub bot_access_token: String,
    pub bot_refresh_token: String,
    pub broadcaster_access_token: String,
    pub broadcaster_refresh_token: String,
}

impl Secrets {
    /// Collect every required secret, reporting all missing names at once.
    pub fn from_env() -> Result<Self> {
        let mut missing = Vec::new();
        let mut fetch = |name: &'static str| -> String {
            match std::env::var(name) {
                Ok(val) if !val.trim().is_empty() => val,
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let secrets = Self {
            client_id: fetch("CLIENT_ID"),
            client_secret: fetch("CLIENT_SECRET"),
            bot_access_token: fetch("BOT_ACCESS_TOKEN"),
            bot_refresh_token: fetch("BOT_REFRESH_TOKEN"),
            broadcaster_access_token: fetch("BROADCASTER_ACCESS_TOKEN"),
            broadcaster_refresh_token: fetch("BROADCASTER_REFRESH_TOKEN"),
        };

        if !missing.is_empty() {
            anyhow::bail!(
                "Missing required environment variables: {} (set them in .env)",
                missing.join(", ")
            );
        }
        Ok(secrets)
    }
}
