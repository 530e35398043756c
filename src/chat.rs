// ABOUTME: Chat transport: outbound via the Helix send endpoint, inbound via EventSub
// ABOUTME: Resolves channel and bot identities on connect; hands out the line stream once

use crate::helix::HelixClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use squawk_core::{ChatLine, ChatTransport, LineStream};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct ChatIds {
    broadcaster_id: String,
    bot_user_id: String,
}

/// Twitch chat seen through Helix. Sends go out as REST calls; inbound
/// lines arrive from the chat-bridge addon through an internal channel,
/// because message delivery itself is an EventSub subscription.
pub struct TwitchChat {
    helix: Arc<HelixClient>,
    channel_login: String,
    bot_login: String,
    ids: Mutex<Option<ChatIds>>,
    line_tx: mpsc::Sender<ChatLine>,
    line_rx: Mutex<Option<mpsc::Receiver<ChatLine>>>,
}

impl TwitchChat {
    pub fn new(
        helix: Arc<HelixClient>,
        channel_login: impl Into<String>,
        bot_login: impl Into<String>,
    ) -> Self {
        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        Self {
            helix,
            channel_login: channel_login.into(),
            bot_login: bot_login.into(),
            ids: Mutex::new(None),
            line_tx,
            line_rx: Mutex::new(Some(line_rx)),
        }
    }

    /// Sender half for whoever feeds inbound lines (the chat-bridge addon).
    pub fn line_sender(&self) -> mpsc::Sender<ChatLine> {
        self.line_tx.clone()
    }
}

#[async_trait]
impl ChatTransport for TwitchChat {
    async fn connect(&self) -> Result<()> {
        let broadcaster_id = self
            .helix
            .get_user_id(&self.channel_login)
            .await
            .with_context(|| format!("Could not resolve channel '{}'", self.channel_login))?;
        let bot_user_id = self
            .helix
            .get_user_id(&self.bot_login)
            .await
            .with_context(|| format!("Could not resolve bot account '{}'", self.bot_login))?;
        tracing::info!(
            channel = %self.channel_login,
            broadcaster_id = %broadcaster_id,
            "Chat transport connected"
        );
        *self.ids.lock().await = Some(ChatIds {
            broadcaster_id,
            bot_user_id,
        });
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        let ids = self
            .ids
            .lock()
            .await
            .clone()
            .context("Chat transport not connected")?;
        self.helix
            .send_chat_message(&ids.broadcaster_id, &ids.bot_user_id, text)
            .await
    }

    fn line_stream(&self) -> Result<LineStream> {
        let mut slot = self
            .line_rx
            .try_lock()
            .context("Line stream receiver is busy")?;
        let rx = slot.take().context("Chat line stream already taken")?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<()> {
        tracing::info!("Chat transport disconnected");
        Ok(())
    }
}
