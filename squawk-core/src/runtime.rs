// ABOUTME: Shared runtime handle passed to addons and the dispatch loop
// ABOUTME: Owns the send path, command table, and deferred subscription/task queues

use crate::commands::{CommandHandler, Dispatcher};
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::traits::{ChatTransport, EventFeed, SubscriptionRequest, TaskFuture};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// An in-flight subscription attempt started during a registration pass
pub struct PendingSubscription {
    pub label: String,
    pub handle: JoinHandle<Result<()>>,
}

struct RuntimeInner {
    chat: Arc<dyn ChatTransport>,
    feed: Arc<dyn EventFeed>,
    limiter: RateLimiter,
    dispatcher: Dispatcher,
    broadcaster_id: String,
    bot_user_id: String,
    pending_subs: Mutex<Vec<PendingSubscription>>,
    pending_tasks: Mutex<Vec<TaskFuture>>,
}

/// Cheaply cloneable handle to the running bot.
///
/// Everything an addon or command handler needs goes through here: the
/// rate-limited send path, command registration, event subscriptions, and
/// the deferred-work queues drained at the startup barrier.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        feed: Arc<dyn EventFeed>,
        limiter: RateLimiter,
        dispatcher: Dispatcher,
        broadcaster_id: impl Into<String>,
        bot_user_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                chat,
                feed,
                limiter,
                dispatcher,
                broadcaster_id: broadcaster_id.into(),
                bot_user_id: bot_user_id.into(),
                pending_subs: Mutex::new(Vec::new()),
                pending_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Send a chat message, waiting on the rate limiter first.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.inner.limiter.acquire().await;
        self.inner.chat.send(&text).await?;
        metrics::record_message_sent();
        Ok(())
    }

    /// Register a chat command. Registering a name twice replaces the
    /// earlier handler and help text.
    pub async fn register_command(&self, name: &str, handler: CommandHandler, help: &str) {
        self.inner.dispatcher.register(name, handler, help).await;
    }

    pub fn broadcaster_id(&self) -> &str {
        &self.inner.broadcaster_id
    }

    pub fn bot_user_id(&self) -> &str {
        &self.inner.bot_user_id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Create an event subscription on the live feed session.
    pub async fn subscribe(&self, request: SubscriptionRequest) -> Result<()> {
        self.inner.feed.subscribe(request).await
    }

    /// Start a subscription attempt in the background and record it for the
    /// startup barrier. The future runs immediately; `await_pending_subscriptions`
    /// collects its outcome.
    pub async fn defer_subscription<F>(&self, label: &str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.inner.pending_subs.lock().await.push(PendingSubscription {
            label: label.to_string(),
            handle,
        });
    }

    /// Queue a one-shot task to run after the startup barrier completes.
    pub async fn queue_task<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending_tasks.lock().await.push(Box::pin(fut));
    }

    pub async fn drain_pending_subscriptions(&self) -> Vec<PendingSubscription> {
        std::mem::take(&mut *self.inner.pending_subs.lock().await)
    }

    pub async fn drain_pending_tasks(&self) -> Vec<TaskFuture> {
        std::mem::take(&mut *self.inner.pending_tasks.lock().await)
    }

    /// Wait for every deferred subscription started by the last registration
    /// pass. Individual failures are logged and counted, not fatal; only
    /// exceeding `limit` errors.
    pub async fn await_pending_subscriptions(&self, limit: Option<Duration>) -> Result<()> {
        let pending = self.drain_pending_subscriptions().await;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(count = pending.len(), "Waiting for event subscriptions");

        let join_all = async {
            for sub in pending {
                match sub.handle.await {
                    Ok(Ok(())) => {
                        tracing::debug!(subscription = %sub.label, "Subscription established");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(subscription = %sub.label, error = %e, "Subscription failed");
                        metrics::record_subscription_failure(&sub.label);
                    }
                    Err(e) => {
                        tracing::error!(subscription = %sub.label, error = %e, "Subscription task panicked");
                        metrics::record_subscription_failure(&sub.label);
                    }
                }
            }
        };

        match limit {
            Some(limit) => tokio::time::timeout(limit, join_all).await.map_err(|_| {
                anyhow::anyhow!(
                    "timed out after {}s waiting for event subscriptions",
                    limit.as_secs()
                )
            }),
            None => {
                join_all.await;
                Ok(())
            }
        }
    }

    /// Spawn every queued one-shot task.
    pub async fn spawn_pending_tasks(&self) {
        for task in self.drain_pending_tasks().await {
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Queued task failed");
                }
            });
        }
    }

    /// Route one chat line through the dispatcher. Matched handlers run in
    /// their own task; a handler error is reported back to chat.
    pub async fn dispatch_line(&self, line: crate::traits::ChatLine) {
        let Some((command, handler)) = self.inner.dispatcher.resolve(&line).await else {
            return;
        };
        let runtime = self.clone();
        let name = command.name.clone();
        tokio::spawn(async move {
            match handler(command, line).await {
                Ok(Some(reply)) => {
                    if let Err(e) = runtime.send(reply).await {
                        tracing::error!(command = %name, error = %e, "Failed to send command reply");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::record_command_error(&name);
                    tracing::warn!(command = %name, error = %e, "Command handler failed");
                    if let Err(send_err) = runtime.send(format!("Error: {}", e)).await {
                        tracing::error!(command = %name, error = %send_err, "Failed to send error reply");
                    }
                }
            }
        });
    }
}
