// ABOUTME: Tests for the Coordinator run loop: startup ordering, dispatch, and teardown.
// ABOUTME: Drives a full bot lifecycle against in-memory chat and event transports.

use anyhow::{Context, Result};
use async_trait::async_trait;
use squawk_core::{
    handler, Addon, AddonCatalog, AddonRegistry, ChatLine, ChatTransport, ChatUser, Coordinator,
    CoordinatorConfig, EventCallback, EventFeed, IdentityResolver, LineStream, Runtime,
    SubscriptionRequest, TokenGuard,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

// =============================================================================
// In-memory transports
// =============================================================================

struct FakeChat {
    sent: Mutex<Vec<(String, Instant)>>,
    line_tx: Mutex<Option<mpsc::Sender<ChatLine>>>,
    line_rx: Mutex<Option<mpsc::Receiver<ChatLine>>>,
    connected: AtomicBool,
    shutdown_log: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeChat {
    fn new(shutdown_log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        let (line_tx, line_rx) = mpsc::channel(64);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            line_tx: Mutex::new(Some(line_tx)),
            line_rx: Mutex::new(Some(line_rx)),
            connected: AtomicBool::new(false),
            shutdown_log,
        })
    }

    async fn push_line(&self, line: ChatLine) {
        let tx = self
            .line_tx
            .lock()
            .unwrap()
            .clone()
            .expect("line channel closed");
        tx.send(line).await.expect("line channel closed");
    }

    /// Drop the sender so the coordinator's line stream ends.
    fn close_lines(&self) {
        self.line_tx.lock().unwrap().take();
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    fn sent_instants_of(&self, text: &str) -> Vec<Instant> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == text)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((text.to_string(), Instant::now()));
        Ok(())
    }

    fn line_stream(&self) -> Result<LineStream> {
        let rx = self
            .line_rx
            .lock()
            .unwrap()
            .take()
            .context("line stream already taken")?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown_log.lock().unwrap().push("chat");
        Ok(())
    }
}

struct FakeFeed {
    session: Mutex<String>,
    started: AtomicBool,
    subscriptions: Mutex<Vec<(String, Instant)>>,
    shutdown_log: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeFeed {
    fn new(shutdown_log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(String::new()),
            started: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            shutdown_log,
        })
    }

    fn set_session(&self, id: &str) {
        *self.session.lock().unwrap() = id.to_string();
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    fn first_subscription_instant(&self) -> Option<Instant> {
        self.subscriptions.lock().unwrap().first().map(|(_, at)| *at)
    }

    fn last_subscription_instant(&self) -> Option<Instant> {
        self.subscriptions.lock().unwrap().last().map(|(_, at)| *at)
    }
}

#[async_trait]
impl EventFeed for FakeFeed {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        self.set_session("sess-1");
        Ok(())
    }

    fn session_id(&self) -> String {
        self.session.lock().unwrap().clone()
    }

    async fn subscribe(&self, request: SubscriptionRequest) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((request.event_type.clone(), Instant::now()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown_log.lock().unwrap().push("feed");
        Ok(())
    }
}

struct FakeTokens {
    validated: AtomicBool,
    granted_scopes: Mutex<Option<String>>,
}

impl FakeTokens {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            validated: AtomicBool::new(false),
            granted_scopes: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TokenGuard for FakeTokens {
    async fn ensure_valid_token(&self) -> Result<()> {
        self.validated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_authorized_grant(&self, scopes: &str) -> Result<()> {
        *self.granted_scopes.lock().unwrap() = Some(scopes.to_string());
        Ok(())
    }
}

struct FakeResolver {
    logins: HashMap<String, String>,
    shutdown_log: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeResolver {
    fn new(shutdown_log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        let mut logins = HashMap::new();
        logins.insert("teststream".to_string(), "100".to_string());
        logins.insert("squawkbot".to_string(), "200".to_string());
        Arc::new(Self {
            logins,
            shutdown_log,
        })
    }
}

#[async_trait]
impl IdentityResolver for FakeResolver {
    async fn user_id(&self, login: &str) -> Result<String> {
        self.logins
            .get(login)
            .cloned()
            .with_context(|| format!("no such user: {}", login))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown_log.lock().unwrap().push("resolver");
        Ok(())
    }
}

// =============================================================================
// Test addon
// =============================================================================

fn noop_callback() -> EventCallback {
    Arc::new(|_event| Box::pin(async {}))
}

struct TestAddon {
    name: &'static str,
    registrations: Arc<AtomicUsize>,
    sub_delay: Duration,
    announce: Option<String>,
    extra_scopes: Vec<String>,
}

impl TestAddon {
    fn new(registrations: Arc<AtomicUsize>) -> Self {
        Self {
            name: "test",
            registrations,
            sub_delay: Duration::from_millis(20),
            announce: None,
            extra_scopes: Vec::new(),
        }
    }
}

#[async_trait]
impl Addon for TestAddon {
    fn name(&self) -> &str {
        self.name
    }

    fn scopes(&self) -> Vec<String> {
        self.extra_scopes.clone()
    }

    async fn register(&self, runtime: &Runtime) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);

        runtime
            .register_command(
                "greet",
                handler(|_cmd, _line| async { Ok(Some("hi there".to_string())) }),
                "says hello",
            )
            .await;
        runtime
            .register_command(
                "fail",
                handler(|_cmd, _line| async { anyhow::bail!("wires crossed") }),
                "always errors",
            )
            .await;

        let rt = runtime.clone();
        let delay = self.sub_delay;
        runtime
            .defer_subscription("test events", async move {
                tokio::time::sleep(delay).await;
                rt.subscribe(SubscriptionRequest::new(
                    "test.event",
                    "1",
                    serde_json::json!({}),
                    noop_callback(),
                ))
                .await
            })
            .await;

        if let Some(announce) = self.announce.clone() {
            let rt = runtime.clone();
            runtime.queue_task(async move { rt.send(announce).await }).await;
        }

        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    chat: Arc<FakeChat>,
    feed: Arc<FakeFeed>,
    tokens: Arc<FakeTokens>,
    registrations: Arc<AtomicUsize>,
    shutdown_log: Arc<Mutex<Vec<&'static str>>>,
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        channel: "teststream".to_string(),
        bot_login: "squawkbot".to_string(),
        probe_message: "probe up".to_string(),
        poll_interval: Duration::from_millis(100),
        subscription_timeout: Some(Duration::from_secs(2)),
        ..CoordinatorConfig::default()
    }
}

/// Spin the whole bot up against the fakes and wait until startup finishes.
async fn start_bot(mut shape: impl FnMut(&mut TestAddon), config: CoordinatorConfig) -> Harness {
    let registrations = Arc::new(AtomicUsize::new(0));
    let mut addon = TestAddon::new(Arc::clone(&registrations));
    shape(&mut addon);
    start_bot_with(vec![addon], registrations, config).await
}

/// Like [`start_bot`] but with any number of addons sharing one
/// registration counter.
async fn start_bot_with(
    addons: Vec<TestAddon>,
    registrations: Arc<AtomicUsize>,
    config: CoordinatorConfig,
) -> Harness {
    let shutdown_log = Arc::new(Mutex::new(Vec::new()));
    let chat = FakeChat::new(Arc::clone(&shutdown_log));
    let feed = FakeFeed::new(Arc::clone(&shutdown_log));
    let tokens = FakeTokens::new();
    let resolver = FakeResolver::new(Arc::clone(&shutdown_log));

    let addon_count = addons.len();
    let mut registry = AddonRegistry::new();
    for addon in addons {
        registry.add_system(Box::new(addon));
    }

    let coordinator = Coordinator::new(
        chat.clone(),
        feed.clone(),
        tokens.clone(),
        resolver,
        registry,
        AddonCatalog::new(),
        PathBuf::from("/nonexistent/addons"),
        config,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        coordinator
            .run(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let reg = Arc::clone(&registrations);
    wait_for("startup to complete", move || {
        reg.load(Ordering::SeqCst) >= addon_count
    })
    .await;
    // startup finishes with the probe already sent; wait for the loop to be live
    let probe_chat = chat.clone();
    wait_for("probe message", move || {
        !probe_chat.sent_texts().is_empty()
    })
    .await;

    Harness {
        chat,
        feed,
        tokens,
        registrations,
        shutdown_log,
        shutdown_tx,
        handle,
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn viewer_line(text: &str) -> ChatLine {
    ChatLine::new(ChatUser::new("42", "viewer"), text)
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_startup_probe_precedes_announcements() {
    let bot = start_bot(
        |addon| {
            addon.sub_delay = Duration::from_millis(100);
            addon.announce = Some("stream bot ready".to_string());
        },
        test_config(),
    )
    .await;

    let announce_chat = bot.chat.clone();
    wait_for("announcement", move || {
        announce_chat
            .sent_texts()
            .contains(&"stream bot ready".to_string())
    })
    .await;

    let sent = bot.chat.sent_texts();
    assert_eq!(sent[0], "probe up", "probe must be the first send");
    assert!(sent.contains(&"stream bot ready".to_string()));

    // the announcement may only run once every subscription settled
    let sub_at = bot
        .feed
        .first_subscription_instant()
        .expect("subscription should be recorded");
    let announce_at = bot.chat.sent_instants_of("stream bot ready")[0];
    assert!(
        announce_at >= sub_at,
        "announcement ran before subscriptions settled"
    );

    bot.handle.abort();
}

#[tokio::test]
async fn test_announcement_waits_for_slowest_subscription() {
    let registrations = Arc::new(AtomicUsize::new(0));
    let mut fast = TestAddon::new(Arc::clone(&registrations));
    fast.sub_delay = Duration::from_millis(10);
    fast.announce = Some("stream bot ready".to_string());
    let mut slow = TestAddon::new(Arc::clone(&registrations));
    slow.name = "slow";
    slow.sub_delay = Duration::from_millis(250);

    let bot = start_bot_with(vec![fast, slow], registrations, test_config()).await;

    let announce_chat = bot.chat.clone();
    wait_for("announcement", move || {
        announce_chat
            .sent_texts()
            .contains(&"stream bot ready".to_string())
    })
    .await;

    // both subscriptions settled before the queued announcement ran
    assert_eq!(bot.feed.subscription_count(), 2);
    let last_sub = bot
        .feed
        .last_subscription_instant()
        .expect("subscriptions should be recorded");
    let announce_at = bot.chat.sent_instants_of("stream bot ready")[0];
    assert!(
        announce_at >= last_sub,
        "announcement ran before the slowest subscription settled"
    );

    bot.handle.abort();
}

#[tokio::test]
async fn test_startup_validates_token_and_checks_grant() {
    let bot = start_bot(
        |addon| {
            addon.extra_scopes = vec!["special:scope".to_string()];
        },
        test_config(),
    )
    .await;

    assert!(bot.tokens.validated.load(Ordering::SeqCst));
    assert!(bot.chat.connected.load(Ordering::SeqCst));
    assert!(bot.feed.started.load(Ordering::SeqCst));
    let scopes = bot
        .tokens
        .granted_scopes
        .lock()
        .unwrap()
        .clone()
        .expect("grant check should run");
    assert_eq!(
        scopes,
        "channel:read:redemptions chat:edit chat:read special:scope"
    );

    bot.handle.abort();
}

#[tokio::test]
async fn test_startup_fails_when_subscriptions_hang() {
    let shutdown_log = Arc::new(Mutex::new(Vec::new()));
    let chat = FakeChat::new(Arc::clone(&shutdown_log));
    let feed = FakeFeed::new(Arc::clone(&shutdown_log));
    let resolver = FakeResolver::new(Arc::clone(&shutdown_log));

    let registrations = Arc::new(AtomicUsize::new(0));
    let mut addon = TestAddon::new(registrations);
    addon.sub_delay = Duration::from_secs(60);

    let mut registry = AddonRegistry::new();
    registry.add_system(Box::new(addon));

    let mut config = test_config();
    config.subscription_timeout = Some(Duration::from_millis(200));

    let coordinator = Coordinator::new(
        chat,
        feed,
        FakeTokens::new(),
        resolver,
        registry,
        AddonCatalog::new(),
        PathBuf::from("/nonexistent/addons"),
        config,
    );

    let result = timeout(Duration::from_secs(5), coordinator.run(std::future::pending()))
        .await
        .expect("startup should fail fast, not hang");
    let err = result.expect_err("hung subscriptions must abort startup");
    assert!(
        format!("{:#}", err).contains("did not complete during startup"),
        "unexpected error: {:#}",
        err
    );

    // the transports started during startup must not be left running
    assert_eq!(
        *shutdown_log.lock().unwrap(),
        vec!["feed", "resolver", "chat"],
        "failed startup must still release the transports"
    );
}

#[tokio::test]
async fn test_startup_resolution_failure_releases_transports() {
    let shutdown_log = Arc::new(Mutex::new(Vec::new()));
    let chat = FakeChat::new(Arc::clone(&shutdown_log));
    let feed = FakeFeed::new(Arc::clone(&shutdown_log));
    let resolver = FakeResolver::new(Arc::clone(&shutdown_log));

    let mut registry = AddonRegistry::new();
    registry.add_system(Box::new(TestAddon::new(Arc::new(AtomicUsize::new(0)))));

    let mut config = test_config();
    config.channel = "nobody".to_string();

    let coordinator = Coordinator::new(
        chat,
        feed,
        FakeTokens::new(),
        resolver,
        registry,
        AddonCatalog::new(),
        PathBuf::from("/nonexistent/addons"),
        config,
    );

    let result = timeout(Duration::from_secs(5), coordinator.run(std::future::pending()))
        .await
        .expect("startup should fail fast, not hang");
    let err = result.expect_err("an unresolvable channel must abort startup");
    assert!(
        format!("{:#}", err).contains("Could not resolve channel"),
        "unexpected error: {:#}",
        err
    );
    assert_eq!(
        *shutdown_log.lock().unwrap(),
        vec!["feed", "resolver", "chat"],
        "failed startup must still release the transports"
    );
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_command_dispatch_is_case_insensitive() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.chat.push_line(viewer_line("!GREET")).await;

    let chat = bot.chat.clone();
    wait_for("command reply", move || {
        chat.sent_texts().contains(&"hi there".to_string())
    })
    .await;

    bot.handle.abort();
}

#[tokio::test]
async fn test_unknown_command_is_silent() {
    let bot = start_bot(|_| {}, test_config()).await;
    let before = bot.chat.sent_texts().len();

    bot.chat.push_line(viewer_line("!nosuch")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        bot.chat.sent_texts().len(),
        before,
        "unknown commands must not produce replies"
    );

    bot.handle.abort();
}

#[tokio::test]
async fn test_own_and_echoed_lines_are_suppressed() {
    let bot = start_bot(|_| {}, test_config()).await;
    let before = bot.chat.sent_texts().len();

    bot.chat
        .push_line(ChatLine::new(ChatUser::new("200", "SquawkBot"), "!greet"))
        .await;
    let mut echoed = viewer_line("!greet");
    echoed.echo = true;
    bot.chat.push_line(echoed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        bot.chat.sent_texts().len(),
        before,
        "bot must never answer itself"
    );

    bot.handle.abort();
}

#[tokio::test]
async fn test_handler_error_is_reported_and_loop_survives() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.chat.push_line(viewer_line("!fail")).await;
    let chat = bot.chat.clone();
    wait_for("error reply", move || {
        chat.sent_texts()
            .contains(&"Error: wires crossed".to_string())
    })
    .await;

    // the loop keeps dispatching after a handler error
    bot.chat.push_line(viewer_line("!greet")).await;
    let chat = bot.chat.clone();
    wait_for("next command reply", move || {
        chat.sent_texts().contains(&"hi there".to_string())
    })
    .await;

    bot.handle.abort();
}

#[tokio::test]
async fn test_help_lists_commands_sorted() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.chat.push_line(viewer_line("!help")).await;

    let chat = bot.chat.clone();
    wait_for("help reply", move || {
        chat.sent_texts()
            .contains(&"Commands: !fail !greet !help".to_string())
    })
    .await;

    bot.handle.abort();
}

#[tokio::test]
async fn test_help_describes_single_command() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.chat.push_line(viewer_line("!help greet")).await;

    let chat = bot.chat.clone();
    wait_for("command help reply", move || {
        chat.sent_texts()
            .contains(&"!greet: says hello".to_string())
    })
    .await;

    bot.handle.abort();
}

// =============================================================================
// Reconnect recovery
// =============================================================================

#[tokio::test]
async fn test_session_change_triggers_reregistration() {
    let bot = start_bot(
        |addon| {
            addon.announce = Some("stream bot ready".to_string());
        },
        test_config(),
    )
    .await;

    assert_eq!(bot.registrations.load(Ordering::SeqCst), 1);

    bot.feed.set_session("sess-2");
    let reg = Arc::clone(&bot.registrations);
    wait_for("re-registration", move || reg.load(Ordering::SeqCst) >= 2).await;

    let feed = bot.feed.clone();
    wait_for("re-subscription", move || feed.subscription_count() >= 2).await;

    // a second change is recovered the same way
    bot.feed.set_session("sess-3");
    let reg = Arc::clone(&bot.registrations);
    wait_for("second re-registration", move || {
        reg.load(Ordering::SeqCst) >= 3
    })
    .await;

    // one-shot announcements must not repeat on reconnect
    tokio::time::sleep(Duration::from_millis(200)).await;
    let announcements = bot.chat.sent_instants_of("stream bot ready").len();
    assert_eq!(announcements, 1, "announcement repeated after reconnect");

    bot.handle.abort();
}

#[tokio::test]
async fn test_empty_session_id_does_not_trigger_reregistration() {
    let bot = start_bot(|_| {}, test_config()).await;
    assert_eq!(bot.registrations.load(Ordering::SeqCst), 1);

    // a feed mid-reconnect reports no session yet
    bot.feed.set_session("");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bot.registrations.load(Ordering::SeqCst), 1);

    // coming back with the original session is a graceful resume
    bot.feed.set_session("sess-1");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bot.registrations.load(Ordering::SeqCst), 1);

    bot.handle.abort();
}

// =============================================================================
// Send path
// =============================================================================

#[tokio::test]
async fn test_replies_respect_rate_limit() {
    let mut config = test_config();
    config.rate_burst = 2;
    config.rate_window = Duration::from_millis(300);
    let bot = start_bot(|_| {}, config).await;

    for _ in 0..5 {
        bot.chat.push_line(viewer_line("!greet")).await;
    }

    let chat = bot.chat.clone();
    wait_for("all five replies", move || {
        chat.sent_instants_of("hi there").len() == 5
    })
    .await;

    let mut times = bot.chat.sent_instants_of("hi there");
    times.sort();
    for pair in times.windows(3) {
        assert!(
            pair[2].duration_since(pair[0]) >= Duration::from_millis(300),
            "three replies landed inside one rate window"
        );
    }

    bot.handle.abort();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_tears_down_in_order() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.shutdown_tx.send(()).expect("coordinator gone");
    let result = timeout(Duration::from_secs(2), bot.handle)
        .await
        .expect("run loop should exit on shutdown")
        .expect("run task panicked");
    result.expect("clean shutdown should return Ok");

    assert_eq!(*bot.shutdown_log.lock().unwrap(), vec!["feed", "resolver", "chat"]);
}

#[tokio::test]
async fn test_closed_line_stream_ends_run_loop() {
    let bot = start_bot(|_| {}, test_config()).await;

    bot.chat.close_lines();

    let result = timeout(Duration::from_secs(2), bot.handle)
        .await
        .expect("run loop should exit when the line stream closes")
        .expect("run task panicked");
    result.expect("stream close is a clean exit");
}
