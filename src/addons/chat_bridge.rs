// ABOUTME: System addon bridging EventSub chat notifications into the line stream
// ABOUTME: Message delivery is itself a subscription, so reconnects re-wire it here

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use squawk_core::{Addon, ChatLine, ChatUser, Runtime, SubscriptionRequest};
use std::sync::Arc;
use tokio::sync::mpsc;

const CHAT_MESSAGE_EVENT: &str = "channel.chat.message";

/// Feeds inbound chat into the transport's line channel.
///
/// Always on, never discovered from disk. Because it registers through the
/// same pass as every other addon, a session change re-creates the chat
/// subscription before the watchdog reports the session recovered.
pub struct ChatBridge {
    line_tx: mpsc::Sender<ChatLine>,
}

impl ChatBridge {
    pub fn new(line_tx: mpsc::Sender<ChatLine>) -> Self {
        Self { line_tx }
    }
}

/// Build a [`ChatLine`] from a chat-message notification payload. The echo
/// flag is derived from the chatter id so the bot's own messages never loop
/// back into dispatch.
fn parse_chat_event(event: &serde_json::Value, bot_user_id: &str) -> Option<ChatLine> {
    let chatter_id = event["chatter_user_id"].as_str()?;
    let login = event["chatter_user_login"].as_str()?;
    let text = event["message"]["text"].as_str()?;

    let sender = match event["chatter_user_name"].as_str() {
        Some(name) => ChatUser::with_name(chatter_id, login, name),
        None => ChatUser::new(chatter_id, login),
    };
    let mut line = ChatLine::new(sender, text);
    line.echo = chatter_id == bot_user_id;
    if let Some(badges) = event["badges"].as_array() {
        for badge in badges {
            match badge["set_id"].as_str() {
                Some("broadcaster") => line.is_broadcaster = true,
                Some("moderator") => line.is_moderator = true,
                _ => {}
            }
        }
    }
    Some(line)
}

#[async_trait]
impl Addon for ChatBridge {
    fn name(&self) -> &str {
        "chat_bridge"
    }

    fn scopes(&self) -> Vec<String> {
        vec!["user:bot".to_string(), "user:read:chat".to_string()]
    }

    async fn register(&self, runtime: &Runtime) -> Result<()> {
        let bot_user_id = runtime.bot_user_id().to_string();
        let line_tx = self.line_tx.clone();
        let callback = Arc::new(move |event: serde_json::Value| {
            let bot_user_id = bot_user_id.clone();
            let line_tx = line_tx.clone();
            Box::pin(async move {
                let Some(line) = parse_chat_event(&event, &bot_user_id) else {
                    tracing::debug!("Chat notification missing expected fields");
                    return;
                };
                if line_tx.send(line).await.is_err() {
                    tracing::warn!("Chat line channel closed, dropping message");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });

        let request = SubscriptionRequest::new(
            CHAT_MESSAGE_EVENT,
            "1",
            json!({
                "broadcaster_user_id": runtime.broadcaster_id(),
                "user_id": runtime.bot_user_id(),
            }),
            callback,
        );
        let rt = runtime.clone();
        runtime
            .defer_subscription("chat messages", async move { rt.subscribe(request).await })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_event(chatter_id: &str, login: &str, text: &str) -> serde_json::Value {
        json!({
            "broadcaster_user_id": "100",
            "chatter_user_id": chatter_id,
            "chatter_user_login": login,
            "chatter_user_name": login.to_uppercase(),
            "message": {"text": text},
            "badges": [],
            "message_type": "text",
        })
    }

    #[test]
    fn test_parse_regular_line() {
        let event = chat_event("42", "viewer", "!ping");
        let line = parse_chat_event(&event, "200").expect("line");
        assert_eq!(line.sender.id, "42");
        assert_eq!(line.sender.login, "viewer");
        assert_eq!(line.sender.display_name.as_deref(), Some("VIEWER"));
        assert_eq!(line.text, "!ping");
        assert!(!line.echo);
        assert!(!line.is_privileged());
    }

    #[test]
    fn test_parse_marks_own_message_as_echo() {
        let event = chat_event("200", "squawkbot", "pong");
        let line = parse_chat_event(&event, "200").expect("line");
        assert!(line.echo);
    }

    #[test]
    fn test_parse_reads_badges() {
        let mut event = chat_event("100", "streamer", "hi");
        event["badges"] = json!([{"set_id": "broadcaster", "id": "1"}]);
        let line = parse_chat_event(&event, "200").expect("line");
        assert!(line.is_broadcaster);
        assert!(!line.is_moderator);

        let mut event = chat_event("77", "helper", "hi");
        event["badges"] = json!([{"set_id": "moderator", "id": "1"}]);
        let line = parse_chat_event(&event, "200").expect("line");
        assert!(line.is_moderator);
    }

    #[test]
    fn test_parse_rejects_incomplete_event() {
        assert!(parse_chat_event(&json!({"chatter_user_id": "42"}), "200").is_none());
        assert!(parse_chat_event(&json!({}), "200").is_none());
    }

    #[test]
    fn test_parse_tolerates_missing_display_name() {
        let mut event = chat_event("42", "viewer", "hello");
        event["chatter_user_name"] = serde_json::Value::Null;
        let line = parse_chat_event(&event, "200").expect("line");
        assert!(line.sender.display_name.is_none());
    }

    #[test]
    fn test_declares_chat_scopes() {
        let (tx, _rx) = mpsc::channel(1);
        let bridge = ChatBridge::new(tx);
        assert_eq!(bridge.scopes(), vec!["user:bot", "user:read:chat"]);
    }
}
