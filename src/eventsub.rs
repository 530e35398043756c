// ABOUTME: EventSub websocket feed: connection loop, frame handling, callback routing
// ABOUTME: Exposes the live session id so the runtime can detect forced reconnects

use crate::helix::HelixClient;
use crate::oauth::TwitchTokens;
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use squawk_core::metrics::record_event_notification;
use squawk_core::{EventCallback, EventFeed, SubscriptionRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const HANDSHAKE_LIMIT: Duration = Duration::from_secs(15);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What the connection loop should do after a frame
#[derive(Debug, PartialEq)]
enum FrameOutcome {
    Continue,
    /// Server asked us to move to a new socket; the session survives
    Reconnect(String),
}

/// EventSub over websocket.
///
/// The session id is published through a watch channel: empty until the
/// welcome handshake, replaced on every new welcome. A server-directed
/// reconnect keeps the same session id, so subscriptions survive and the
/// runtime's watchdog stays quiet. A dropped connection comes back with a
/// fresh id, which is the watchdog's cue to re-register everything.
pub struct EventSubFeed {
    helix: Arc<HelixClient>,
    tokens: Arc<TwitchTokens>,
    session_tx: watch::Sender<String>,
    session_rx: watch::Receiver<String>,
    callbacks: Arc<Mutex<HashMap<String, EventCallback>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl EventSubFeed {
    pub fn new(helix: Arc<HelixClient>, tokens: Arc<TwitchTokens>) -> Self {
        let (session_tx, session_rx) = watch::channel(String::new());
        Self {
            helix,
            tokens,
            session_tx,
            session_rx,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }

    /// Connect, read frames, reconnect forever. Runs as a background task.
    async fn connection_loop(
        session_tx: watch::Sender<String>,
        callbacks: Arc<Mutex<HashMap<String, EventCallback>>>,
    ) {
        let mut url = EVENTSUB_WS_URL.to_string();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    tracing::debug!(url = %url, "EventSub websocket connected");
                    backoff = INITIAL_BACKOFF;
                    let (mut write, mut read) = socket.split();
                    let mut next_url: Option<String> = None;

                    while let Some(frame) = read.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                match handle_frame(text.as_str(), &session_tx, &callbacks).await {
                                    FrameOutcome::Continue => {}
                                    FrameOutcome::Reconnect(reconnect_url) => {
                                        tracing::info!("EventSub server requested reconnect");
                                        next_url = Some(reconnect_url);
                                        break;
                                    }
                                }
                            }
                            Ok(Message::Ping(data)) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    tracing::warn!(error = %e, "Failed to answer websocket ping");
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                tracing::warn!("EventSub websocket closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "EventSub websocket read error");
                                break;
                            }
                        }
                    }

                    if let Some(reconnect_url) = next_url {
                        // graceful handover: the new socket resumes the same session
                        url = reconnect_url;
                        continue;
                    }
                    // the session died with the connection; subscriptions are void
                    // until a new welcome arrives
                    url = EVENTSUB_WS_URL.to_string();
                    let _ = session_tx.send(String::new());
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %url, "EventSub connection failed");
                    url = EVENTSUB_WS_URL.to_string();
                    let _ = session_tx.send(String::new());
                }
            }

            tracing::info!(delay_secs = backoff.as_secs(), "Reconnecting EventSub after delay");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[async_trait::async_trait]
impl EventFeed for EventSubFeed {
    async fn start(&self) -> Result<()> {
        let session_tx = self.session_tx.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let handle = tokio::spawn(Self::connection_loop(session_tx, callbacks));
        *self.reader.lock().await = Some(handle);

        let mut rx = self.session_rx.clone();
        let handshake = rx.wait_for(|id| !id.is_empty());
        tokio::time::timeout(HANDSHAKE_LIMIT, handshake)
            .await
            .context("Timed out waiting for the EventSub welcome")?
            .context("EventSub connection task ended before the handshake")?;
        Ok(())
    }

    fn session_id(&self) -> String {
        self.session_rx.borrow().clone()
    }

    async fn subscribe(&self, req: SubscriptionRequest) -> Result<()> {
        let session_id = self.session_id();
        if session_id.is_empty() {
            bail!("No live EventSub session to subscribe on");
        }

        // chat-message subscriptions authorize as the bot; everything else
        // rides the broadcaster grant
        let token = if req.event_type == "channel.chat.message" {
            self.tokens.bot_access_token().await
        } else {
            self.tokens.broadcaster_access_token().await
        };

        self.helix
            .create_eventsub_subscription(
                &req.event_type,
                &req.version,
                &req.condition,
                &session_id,
                &token,
            )
            .await?;
        self.callbacks
            .lock()
            .await
            .insert(req.event_type.clone(), req.callback);
        tracing::info!(event_type = %req.event_type, "EventSub subscription created");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let _ = self.session_tx.send(String::new());
        tracing::info!("EventSub feed stopped");
        Ok(())
    }
}

/// Interpret one text frame from the websocket.
async fn handle_frame(
    text: &str,
    session_tx: &watch::Sender<String>,
    callbacks: &Mutex<HashMap<String, EventCallback>>,
) -> FrameOutcome {
    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable EventSub frame");
            return FrameOutcome::Continue;
        }
    };

    match frame["metadata"]["message_type"].as_str().unwrap_or("") {
        "session_welcome" => {
            let id = frame["payload"]["session"]["id"].as_str().unwrap_or("");
            if id.is_empty() {
                tracing::warn!("EventSub welcome without a session id");
            } else {
                tracing::debug!(session = %id, "EventSub session welcome");
                let _ = session_tx.send(id.to_string());
            }
            FrameOutcome::Continue
        }
        "session_keepalive" => FrameOutcome::Continue,
        "session_reconnect" => match frame["payload"]["session"]["reconnect_url"].as_str() {
            Some(url) => FrameOutcome::Reconnect(url.to_string()),
            None => {
                tracing::warn!("EventSub reconnect frame without a url");
                FrameOutcome::Continue
            }
        },
        "notification" => {
            let event_type = frame["metadata"]["subscription_type"]
                .as_str()
                .unwrap_or("");
            record_event_notification(event_type);
            let registered = callbacks.lock().await;
            if let Some(callback) = registered.get(event_type) {
                let callback = Arc::clone(callback);
                let event = frame["payload"]["event"].clone();
                tokio::spawn(callback(event));
            } else {
                tracing::debug!(event_type = %event_type, "Notification with no registered callback");
            }
            FrameOutcome::Continue
        }
        "revocation" => {
            let event_type = frame["payload"]["subscription"]["type"]
                .as_str()
                .unwrap_or("");
            tracing::warn!(event_type = %event_type, "EventSub subscription revoked");
            FrameOutcome::Continue
        }
        other => {
            tracing::debug!(message_type = %other, "Ignoring EventSub frame");
            FrameOutcome::Continue
        }
    }
}
