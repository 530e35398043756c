// ABOUTME: Liveness commands: !ping answers pong, !uptime reports process uptime
// ABOUTME: The smallest addon, also the template for writing new ones

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use squawk_core::{handler, Addon, Runtime};
use std::path::Path;
use std::time::{Duration, Instant};

pub struct PingAddon {
    launched: Instant,
    launched_at: DateTime<Utc>,
}

pub fn build(_home: &Path) -> Result<Box<dyn Addon>> {
    Ok(Box::new(PingAddon {
        launched: Instant::now(),
        launched_at: Utc::now(),
    }))
}

fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[async_trait]
impl Addon for PingAddon {
    fn name(&self) -> &str {
        "ping"
    }

    async fn register(&self, runtime: &Runtime) -> Result<()> {
        runtime
            .register_command(
                "ping",
                handler(|_cmd, _line| async { Ok(Some("pong".to_string())) }),
                "check the bot is alive",
            )
            .await;

        let launched = self.launched;
        let launched_at = self.launched_at;
        runtime
            .register_command(
                "uptime",
                handler(move |_cmd, _line| {
                    let reply = format!(
                        "Online for {} (since {} UTC)",
                        format_uptime(launched.elapsed()),
                        launched_at.format("%Y-%m-%d %H:%M")
                    );
                    async move { Ok(Some(reply)) }
                }),
                "show how long the bot has been up",
            )
            .await;
        Ok(())
    }
}
