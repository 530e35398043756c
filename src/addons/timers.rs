// ABOUTME: Timed announcements: a one-shot online message and an optional rotation
// ABOUTME: Both are configured through the addon.toml in the addon's home directory

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use squawk_core::{Addon, Runtime};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
struct TimersConfig {
    #[serde(default)]
    online: OnlineConfig,
    #[serde(default)]
    rotation: RotationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OnlineConfig {
    /// Announcement queued at startup; nothing is sent when unset
    message: Option<String>,
    /// Seconds to hold the announcement back after startup completes
    #[serde(default)]
    delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RotationConfig {
    /// Messages sent round-robin while the bot runs
    #[serde(default)]
    messages: Vec<String>,
    #[serde(default = "default_rotation_interval")]
    interval_secs: u64,
}

fn default_rotation_interval() -> u64 {
    600
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            interval_secs: default_rotation_interval(),
        }
    }
}

pub struct TimersAddon {
    config: TimersConfig,
}

pub fn build(home: &Path) -> Result<Box<dyn Addon>> {
    let config = load_config(home)?;
    Ok(Box::new(TimersAddon { config }))
}

fn load_config(home: &Path) -> Result<TimersConfig> {
    let path = home.join("addon.toml");
    if !path.exists() {
        return Ok(TimersConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[async_trait]
impl Addon for TimersAddon {
    fn name(&self) -> &str {
        "timers"
    }

    async fn register(&self, runtime: &Runtime) -> Result<()> {
        let Some(message) = self.config.online.message.clone() else {
            return Ok(());
        };
        let delay = Duration::from_secs(self.config.online.delay_secs);
        let rt = runtime.clone();
        runtime
            .queue_task(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                rt.send(message).await
            })
            .await;
        Ok(())
    }

    async fn start(&self, runtime: &Runtime) -> Result<()> {
        if self.config.rotation.messages.is_empty() {
            return Ok(());
        }
        let interval = Duration::from_secs(self.config.rotation.interval_secs.max(1));
        let messages = self.config.rotation.messages.clone();
        tracing::info!(
            count = messages.len(),
            interval_secs = interval.as_secs(),
            "Message rotation running"
        );
        loop {
            for message in &messages {
                tokio::time::sleep(interval).await;
                // a failed send skips one slot, the rotation keeps going
                if let Err(e) = runtime.send(message.clone()).await {
                    tracing::warn!(error = %e, "Rotation message failed");
                }
            }
        }
    }
}
