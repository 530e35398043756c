// ABOUTME: Acknowledges channel point reward redemptions in chat
// ABOUTME: Subscribes to the redemption event and formats a configurable template

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use squawk_core::{Addon, Runtime, SubscriptionRequest};
use std::path::Path;
use std::sync::Arc;

const REDEMPTION_EVENT: &str = "channel.channel_points_custom_reward_redemption.add";

#[derive(Debug, Clone, Deserialize)]
struct RedeemConfig {
    /// Only redemptions of this reward are acknowledged; unset matches all
    reward_title: Option<String>,
    /// `{user}` and `{reward}` are substituted
    #[serde(default = "default_template")]
    template: String,
}

fn default_template() -> String {
    "{user} redeemed {reward}!".to_string()
}

impl Default for RedeemConfig {
    fn default() -> Self {
        Self {
            reward_title: None,
            template: default_template(),
        }
    }
}

pub struct RedeemAlertsAddon {
    config: RedeemConfig,
}

pub fn build(home: &Path) -> Result<Box<dyn Addon>> {
    let config = load_config(home)?;
    Ok(Box::new(RedeemAlertsAddon { config }))
}

fn load_config(home: &Path) -> Result<RedeemConfig> {
    let path = home.join("addon.toml");
    if !path.exists() {
        return Ok(RedeemConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Reply for a redemption event, or `None` when the reward doesn't match
/// the configured title.
fn alert_for_event(
    event: &serde_json::Value,
    wanted_title: Option<&str>,
    template: &str,
) -> Option<String> {
    let reward = event["reward"]["title"].as_str()?;
    if let Some(wanted) = wanted_title {
        if !reward.eq_ignore_ascii_case(wanted) {
            return None;
        }
    }
    let user = event["user_name"]
        .as_str()
        .or_else(|| event["user_login"].as_str())
        .unwrap_or("someone");
    Some(template.replace("{user}", user).replace("{reward}", reward))
}

#[async_trait]
impl Addon for RedeemAlertsAddon {
    fn name(&self) -> &str {
        "redeem_alerts"
    }

    fn scopes(&self) -> Vec<String> {
        vec!["channel:read:redemptions".to_string()]
    }

    async fn register(&self, runtime: &Runtime) -> Result<()> {
        let wanted_title = self.config.reward_title.clone();
        let template = self.config.template.clone();
        let send_rt = runtime.clone();
        let callback = Arc::new(move |event: serde_json::Value| {
            let wanted_title = wanted_title.clone();
            let template = template.clone();
            let rt = send_rt.clone();
            Box::pin(async move {
                let Some(alert) = alert_for_event(&event, wanted_title.as_deref(), &template)
                else {
                    return;
                };
                if let Err(e) = rt.send(alert).await {
                    tracing::warn!(error = %e, "Redemption alert failed to send");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });

        let request = SubscriptionRequest::new(
            REDEMPTION_EVENT,
            "1",
            json!({"broadcaster_user_id": runtime.broadcaster_id()}),
            callback,
        );
        let rt = runtime.clone();
        runtime
            .defer_subscription("reward redemptions", async move {
                rt.subscribe(request).await
            })
            .await;
        Ok(())
    }
}
