// ABOUTME: Minimal Helix REST client: user lookup, chat send, EventSub subscription create
// ABOUTME: Doubles as the IdentityResolver handed to the coordinator

use crate::oauth::TwitchTokens;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use squawk_core::IdentityResolver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const HELIX_URL: &str = "https://api.twitch.tv/helix";

/// Thin client over the Helix endpoints the bot needs. Login-to-id lookups
/// are cached for the process lifetime; logins do not change while we run.
pub struct HelixClient {
    http: reqwest::Client,
    tokens: Arc<TwitchTokens>,
    user_cache: Mutex<HashMap<String, String>>,
}

impl HelixClient {
    pub fn new(tokens: Arc<TwitchTokens>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            user_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json(&self, path: &str, token: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}{}", HELIX_URL, path))
            .bearer_auth(token)
            .header("Client-Id", self.tokens.client_id())
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        read_json(path, response).await
    }

    async fn post_json(
        &self,
        path: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{}{}", HELIX_URL, path))
            .bearer_auth(token)
            .header("Client-Id", self.tokens.client_id())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        read_json(path, response).await
    }

    /// Resolve a login name to its numeric user id, cached.
    pub async fn get_user_id(&self, login: &str) -> Result<String> {
        let login = login.to_lowercase();
        if let Some(id) = self.user_cache.lock().await.get(&login) {
            return Ok(id.clone());
        }

        let token = self.tokens.bot_access_token().await;
        let response = self
            .get_json(&format!("/users?login={}", login), &token)
            .await?;
        let Some(id) = extract_user_id(&response) else {
            bail!("No such user: {}", login);
        };

        self.user_cache.lock().await.insert(login, id.clone());
        Ok(id)
    }

    /// Send a chat message as the bot account.
    pub async fn send_chat_message(
        &self,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<()> {
        let token = self.tokens.bot_access_token().await;
        let body = json!({
            "broadcaster_id": broadcaster_id,
            "sender_id": sender_id,
            "message": message,
        });
        let response = self.post_json("/chat/messages", &token, &body).await?;
        check_send_receipt(&response)
    }

    /// Create a websocket-transport EventSub subscription on `session_id`.
    pub async fn create_eventsub_subscription(
        &self,
        event_type: &str,
        version: &str,
        condition: &serde_json::Value,
        session_id: &str,
        token: &str,
    ) -> Result<()> {
        let body = json!({
            "type": event_type,
            "version": version,
            "condition": condition,
            "transport": {
                "method": "websocket",
                "session_id": session_id,
            },
        });
        self.post_json("/eventsub/subscriptions", token, &body)
            .await
            .with_context(|| format!("Could not subscribe to {}", event_type))?;
        Ok(())
    }
}

#[async_trait]
impl IdentityResolver for HelixClient {
    async fn user_id(&self, login: &str) -> Result<String> {
        self.get_user_id(login).await
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("Helix client closed");
        Ok(())
    }
}

async fn read_json(path: &str, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", path, status, body);
    }
    response
        .json()
        .await
        .with_context(|| format!("{} returned malformed JSON", path))
}

fn extract_user_id(response: &serde_json::Value) -> Option<String> {
    response["data"][0]["id"].as_str().map(|s| s.to_string())
}

/// A 2xx from the send endpoint can still mean the message was dropped;
/// the receipt carries the verdict.
fn check_send_receipt(response: &serde_json::Value) -> Result<()> {
    let receipt = &response["data"][0];
    if receipt["is_sent"].as_bool().unwrap_or(false) {
        return Ok(());
    }
    let reason = receipt["drop_reason"]["message"]
        .as_str()
        .unwrap_or("unknown reason");
    bail!("Chat message dropped: {}", reason)
}
