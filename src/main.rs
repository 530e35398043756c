// ABOUTME: Main entry point: wires config, tokens, transports, and the coordinator
// ABOUTME: Initializes logging to stdout plus a daily file, then runs until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use squawk::addons;
use squawk::chat::TwitchChat;
use squawk::config::{Config, Secrets};
use squawk::eventsub::EventSubFeed;
use squawk::helix::HelixClient;
use squawk::oauth::TwitchTokens;
use squawk_core::{AddonRegistry, Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "squawk", version, about = "Twitch chat bot runtime")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Env file refreshed tokens are written back to
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let args = Args::parse();
    dotenvy::dotenv().ok();
    let config = Config::load(&args.config)?;

    let file_appender = tracing_appender::rolling::daily(&config.logs.dir, "squawk.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    tracing::info!(channel = %config.twitch.channel, "Starting squawk");

    if let Some(port) = config.metrics.port {
        squawk_core::metrics::init_metrics(port).context("Failed to start metrics exporter")?;
        tracing::info!(port, "Prometheus exporter listening");
    }

    let secrets = Secrets::from_env()?;
    let tokens = Arc::new(TwitchTokens::new(&secrets, args.env_file));
    let helix = Arc::new(HelixClient::new(Arc::clone(&tokens)));
    let chat = Arc::new(TwitchChat::new(
        Arc::clone(&helix),
        &config.twitch.channel,
        &config.twitch.bot_nick,
    ));
    let feed = Arc::new(EventSubFeed::new(Arc::clone(&helix), Arc::clone(&tokens)));

    let mut registry = AddonRegistry::new();
    registry.add_system(Box::new(addons::chat_bridge::ChatBridge::new(
        chat.line_sender(),
    )));

    let coordinator_config = CoordinatorConfig {
        channel: config.twitch.channel.clone(),
        bot_login: config.twitch.bot_nick.clone(),
        prefix: config.chat.prefix.clone(),
        probe_message: config.chat.probe_message.clone(),
        poll_interval: config.poll_interval(),
        subscription_timeout: config.subscription_timeout(),
        rate_burst: config.rate_limit.burst,
        rate_window: config.rate_window(),
    };

    let coordinator = Coordinator::new(
        chat,
        feed,
        tokens,
        helix,
        registry,
        addons::catalog(),
        PathBuf::from(&config.addons.dir),
        coordinator_config,
    );

    coordinator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await
}
