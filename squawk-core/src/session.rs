// ABOUTME: Event feed session tracking and reconnect recovery
// ABOUTME: Polls the feed's session identity and re-registers addons when it changes

use crate::metrics;
use crate::registry::AddonRegistry;
use crate::runtime::Runtime;
use crate::traits::EventFeed;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Lifecycle of the event subscription session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Starting,
    Live,
    Reconnecting,
    Stopped,
}

/// Tracks which feed session the bot's subscriptions belong to.
///
/// Subscriptions are tied to the session that created them. The feed
/// reconnects on its own after a connection loss, but arrives with a fresh
/// session carrying no subscriptions. The watchdog polls the feed's current
/// session identity and, when it no longer matches the one we subscribed
/// on, drives a full re-registration pass.
pub struct SubscriptionSession {
    feed: Arc<dyn EventFeed>,
    poll_interval: Duration,
    rejoin_limit: Option<Duration>,
    state: Mutex<SessionState>,
    known_session: Mutex<String>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionSession {
    pub fn new(
        feed: Arc<dyn EventFeed>,
        poll_interval: Duration,
        rejoin_limit: Option<Duration>,
    ) -> Self {
        Self {
            feed,
            poll_interval,
            rejoin_limit,
            state: Mutex::new(SessionState::Unstarted),
            known_session: Mutex::new(String::new()),
            watchdog: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Start the feed and record the session identity it handshakes with.
    pub async fn start(&self) -> Result<()> {
        *self.state.lock().await = SessionState::Starting;
        self.feed.start().await.context("Event feed failed to start")?;

        let session_id = self.feed.session_id();
        *self.known_session.lock().await = session_id.clone();
        *self.state.lock().await = SessionState::Live;
        tracing::info!(session = %session_id, "Event session live");
        Ok(())
    }

    /// Spawn the background task that watches for session changes.
    pub async fn spawn_watchdog(self: &Arc<Self>, registry: Arc<AddonRegistry>, runtime: Runtime) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.poll_interval);
            // first tick fires immediately; the session was just captured
            ticker.tick().await;
            loop {
                ticker.tick().await;
                session.check_session(&registry, &runtime).await;
            }
        });
        *self.watchdog.lock().await = Some(handle);
    }

    /// One watchdog pass. If the feed now reports a different session, every
    /// addon is re-registered onto it.
    async fn check_session(&self, registry: &AddonRegistry, runtime: &Runtime) {
        let current = self.feed.session_id();
        if current.is_empty() {
            // feed is mid-reconnect, nothing to re-register onto yet
            return;
        }

        {
            let known = self.known_session.lock().await;
            if current == *known {
                return;
            }
            tracing::warn!(old = %known, new = %current, "Event session changed, re-registering addons");
        }
        metrics::record_reconnect();
        *self.state.lock().await = SessionState::Reconnecting;
        *self.known_session.lock().await = current;

        registry.register_all(runtime).await;
        if let Err(e) = runtime.await_pending_subscriptions(self.rejoin_limit).await {
            tracing::warn!(error = %e, "Re-registration did not complete cleanly");
        }

        // one-shot work was already done at startup; don't repeat it
        let requeued = runtime.drain_pending_tasks().await;
        if !requeued.is_empty() {
            tracing::debug!(count = requeued.len(), "Dropping re-queued one-shot tasks after re-registration");
        }

        *self.state.lock().await = SessionState::Live;
        tracing::info!("Event session recovered");
    }

    /// Stop watching and shut the feed down.
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
        *self.state.lock().await = SessionState::Stopped;
        self.feed.stop().await
    }
}
