// ABOUTME: Collaborator traits between the runtime core and the platform glue
// ABOUTME: Chat transport, event feed, token guard, and identity resolution seams

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

// =============================================================================
// Chat Data Types
// =============================================================================

/// Identity of a chat user as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatUser {
    /// Platform user id (a numeric string on Twitch)
    pub id: String,
    /// Login name, lowercase
    pub login: String,
    /// Display name when it differs from the login
    pub display_name: Option<String>,
}

impl ChatUser {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: None,
        }
    }

    pub fn with_name(
        id: impl Into<String>,
        login: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: Some(name.into()),
        }
    }
}

/// One inbound line from the chat transport
#[derive(Debug, Clone)]
pub struct ChatLine {
    /// Who sent the line
    pub sender: ChatUser,
    /// Message text
    pub text: String,
    /// True when the line is the bot's own message reflected back by the server
    pub echo: bool,
    /// Sender owns the channel
    pub is_broadcaster: bool,
    /// Sender moderates the channel
    pub is_moderator: bool,
    /// When the transport delivered the line
    pub timestamp: DateTime<Utc>,
}

impl ChatLine {
    pub fn new(sender: ChatUser, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            echo: false,
            is_broadcaster: false,
            is_moderator: false,
            timestamp: Utc::now(),
        }
    }

    /// Broadcaster or moderator
    pub fn is_privileged(&self) -> bool {
        self.is_broadcaster || self.is_moderator
    }
}

/// Boxed stream of inbound chat lines
pub type LineStream = Pin<Box<dyn Stream<Item = ChatLine> + Send>>;

/// Boxed future for deferred subscription and queued task work
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

// =============================================================================
// Event Subscriptions
// =============================================================================

/// Callback invoked with the JSON payload of a push event notification
pub type EventCallback =
    Arc<dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A push event subscription request: event type, version, the JSON condition
/// the server matches against, and the callback fed with each notification.
pub struct SubscriptionRequest {
    pub event_type: String,
    pub version: String,
    pub condition: serde_json::Value,
    pub callback: EventCallback,
}

impl SubscriptionRequest {
    pub fn new(
        event_type: impl Into<String>,
        version: impl Into<String>,
        condition: serde_json::Value,
        callback: EventCallback,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            version: version.into(),
            condition,
            callback,
        }
    }
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("event_type", &self.event_type)
            .field("version", &self.version)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Outbound/inbound chat seam. Implementations own the wire protocol; the
/// runtime core only sees lines and raw sends.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Establish the connection and resolve whatever identities the transport
    /// needs for sending.
    async fn connect(&self) -> Result<()>;

    /// Send a raw line to the channel. No rate limiting at this layer.
    async fn send(&self, text: &str) -> Result<()>;

    /// Inbound chat lines as a stream. May only be taken once.
    fn line_stream(&self) -> Result<LineStream>;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Push event transport. Exposes the session identity the runtime polls to
/// detect reconnects that voided server-side subscriptions.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Open the transport and wait until a usable session exists.
    async fn start(&self) -> Result<()>;

    /// Current session identity. Empty until the handshake completes, and a
    /// different value after any reconnect that discarded subscriptions.
    fn session_id(&self) -> String;

    /// Create a server-side subscription bound to the current session.
    async fn subscribe(&self, req: SubscriptionRequest) -> Result<()>;

    /// Close the transport.
    async fn stop(&self) -> Result<()>;
}

/// Credential lifecycle seam for the two accounts the bot acts as.
#[async_trait]
pub trait TokenGuard: Send + Sync {
    /// Validate the bot credential, refreshing once if it is stale. An error
    /// means the bot cannot authenticate and startup should abort.
    async fn ensure_valid_token(&self) -> Result<()>;

    /// Verify the broadcaster grant exists and covers every scope in the
    /// space-separated `scopes` list.
    async fn ensure_authorized_grant(&self, scopes: &str) -> Result<()>;

    /// Refresh any credential that is near expiry.
    async fn refresh_if_needed(&self) -> Result<()> {
        Ok(())
    }
}

/// Authenticated API handle for identity lookups. `close` participates in the
/// shutdown sequence between the event feed and the chat transport.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a login name to the platform user id.
    async fn user_id(&self, login: &str) -> Result<String>;

    /// Release the underlying API session.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
