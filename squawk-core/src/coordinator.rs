// ABOUTME: Startup and shutdown sequencing for the whole bot
// ABOUTME: Wires transports, addons, and the dispatch loop together in order

use crate::commands::{handler, Dispatcher};
use crate::rate_limit::RateLimiter;
use crate::registry::{AddonCatalog, AddonRegistry};
use crate::runtime::Runtime;
use crate::session::SubscriptionSession;
use crate::traits::{ChatTransport, EventFeed, IdentityResolver, TokenGuard};
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Tunables for a coordinator run
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Channel whose chat the bot joins
    pub channel: String,
    /// Login of the bot account, used to suppress self-dispatch
    pub bot_login: String,
    /// Command prefix
    pub prefix: String,
    /// Message sent right after the chat transport connects
    pub probe_message: String,
    /// How often the session watchdog compares session identity
    pub poll_interval: Duration,
    /// Cap on waiting for deferred subscriptions; `None` waits forever
    pub subscription_timeout: Option<Duration>,
    /// Messages allowed per rate window
    pub rate_burst: usize,
    /// Rate limiter window length
    pub rate_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            bot_login: String::new(),
            prefix: "!".to_string(),
            probe_message: "squawk online".to_string(),
            poll_interval: Duration::from_secs(30),
            subscription_timeout: Some(Duration::from_secs(60)),
            rate_burst: 20,
            rate_window: Duration::from_secs(30),
        }
    }
}

/// Owns startup, the dispatch loop, and teardown.
///
/// Startup is strictly ordered: tokens are validated before anything talks
/// to the platform, addons are discovered before the grant check so the
/// scope list is complete, and every deferred subscription must settle
/// before queued announcements run. Shutdown is best effort; each step is
/// attempted even if an earlier one fails.
pub struct Coordinator {
    chat: Arc<dyn ChatTransport>,
    feed: Arc<dyn EventFeed>,
    tokens: Arc<dyn TokenGuard>,
    resolver: Arc<dyn IdentityResolver>,
    registry: AddonRegistry,
    catalog: AddonCatalog,
    addons_dir: PathBuf,
    config: CoordinatorConfig,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        feed: Arc<dyn EventFeed>,
        tokens: Arc<dyn TokenGuard>,
        resolver: Arc<dyn IdentityResolver>,
        registry: AddonRegistry,
        catalog: AddonCatalog,
        addons_dir: PathBuf,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            chat,
            feed,
            tokens,
            resolver,
            registry,
            catalog,
            addons_dir,
            config,
        }
    }

    /// Bring the bot up, dispatch chat lines until `shutdown` resolves or
    /// the line stream ends, then tear everything down.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Coordinator {
            chat,
            feed,
            tokens,
            resolver,
            mut registry,
            catalog,
            addons_dir,
            config,
        } = self;

        tokens
            .ensure_valid_token()
            .await
            .context("Bot token validation failed")?;

        registry.discover(&addons_dir, &catalog)?;
        let scope_string = registry.scope_string();
        tracing::info!(addons = ?registry.names(), scopes = %scope_string, "Addons loaded");

        tokens
            .ensure_authorized_grant(&scope_string)
            .await
            .context("Authorization grant check failed")?;
        if let Err(e) = tokens.refresh_if_needed().await {
            tracing::warn!(error = %e, "Token refresh failed, continuing with current token");
        }

        chat.connect()
            .await
            .context("Chat transport connection failed")?;
        match chat.send(&config.probe_message).await {
            Ok(()) => tracing::info!("Probe message sent"),
            Err(e) => tracing::warn!(error = %e, "Probe message failed"),
        }

        let session = Arc::new(SubscriptionSession::new(
            feed.clone(),
            config.poll_interval,
            config.subscription_timeout,
        ));

        // Once the chat transport is up, any startup failure must still
        // release the transports before propagating.
        let bring_up = async {
            let broadcaster_id = resolver
                .user_id(&config.channel)
                .await
                .with_context(|| format!("Could not resolve channel '{}'", config.channel))?;
            let bot_user_id = resolver
                .user_id(&config.bot_login)
                .await
                .with_context(|| format!("Could not resolve bot account '{}'", config.bot_login))?;

            session.start().await.context("Event session failed to start")?;

            let dispatcher = Dispatcher::new(&config.prefix, &config.bot_login);
            let limiter = RateLimiter::new(config.rate_burst, config.rate_window);
            let runtime = Runtime::new(
                chat.clone(),
                feed.clone(),
                limiter,
                dispatcher,
                broadcaster_id,
                bot_user_id,
            );

            let registry = Arc::new(registry);
            registry.register_all(&runtime).await;
            runtime
                .await_pending_subscriptions(config.subscription_timeout)
                .await
                .context("Event subscriptions did not complete during startup")?;
            anyhow::Ok((runtime, registry))
        };
        let (runtime, registry) = match bring_up.await {
            Ok(up) => up,
            Err(e) => {
                tracing::error!(error = %e, "Startup failed, releasing transports");
                Self::teardown(&session, resolver.as_ref(), chat.as_ref()).await;
                return Err(e);
            }
        };
        runtime.spawn_pending_tasks().await;
        registry.start_all(&runtime).await;
        session.spawn_watchdog(Arc::clone(&registry), runtime.clone()).await;

        // registered after every addon so the listing is complete
        let help_runtime = runtime.clone();
        runtime
            .register_command(
                "help",
                handler(move |cmd, _line| {
                    let rt = help_runtime.clone();
                    async move {
                        match cmd.first_arg() {
                            Some(name) => match rt.dispatcher().help_for(name).await {
                                Some(help) => Ok(Some(help)),
                                None => Ok(Some(format!("No such command: {}", name))),
                            },
                            None => Ok(Some(rt.dispatcher().help_text().await)),
                        }
                    }
                }),
                "list commands, or describe one",
            )
            .await;

        tracing::info!(channel = %config.channel, "Bot online");

        let mut lines = match chat.line_stream().context("Chat line stream unavailable") {
            Ok(lines) => lines,
            Err(e) => {
                tracing::error!(error = %e, "Startup failed, releasing transports");
                Self::teardown(&session, resolver.as_ref(), chat.as_ref()).await;
                return Err(e);
            }
        };
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                maybe_line = lines.next() => {
                    match maybe_line {
                        Some(line) => runtime.dispatch_line(line).await,
                        None => {
                            tracing::warn!("Chat line stream closed");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        Self::teardown(&session, resolver.as_ref(), chat.as_ref()).await;
        Ok(())
    }

    /// Release the transports in order. Every step runs even if an earlier
    /// one fails, and the session always ends up stopped.
    async fn teardown(
        session: &SubscriptionSession,
        resolver: &dyn IdentityResolver,
        chat: &dyn ChatTransport,
    ) {
        if let Err(e) = session.stop().await {
            tracing::warn!(error = %e, "Event session stop failed");
        }
        if let Err(e) = resolver.close().await {
            tracing::warn!(error = %e, "Identity resolver close failed");
        }
        if let Err(e) = chat.disconnect().await {
            tracing::warn!(error = %e, "Chat disconnect failed");
        }
        tracing::info!("Shutdown complete");
    }
}
