// ABOUTME: Platform-agnostic chat bot runtime: addons, commands, rate limiting, sessions
// ABOUTME: Traits and core logic for any chat/event transport pair

pub mod commands;
pub mod coordinator;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod traits;

// Re-export the types addon authors and embedders touch most
pub use commands::{handler, Command, CommandHandler, Dispatcher, ParseResult};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use rate_limit::RateLimiter;
pub use registry::{Addon, AddonCatalog, AddonFactory, AddonRegistry, ADDON_DIR_PREFIX, CORE_SCOPES};
pub use runtime::{PendingSubscription, Runtime};
pub use session::{SessionState, SubscriptionSession};
pub use traits::{
    ChatLine, ChatTransport, ChatUser, EventCallback, EventFeed, IdentityResolver, LineStream,
    SubscriptionRequest, TaskFuture, TokenGuard,
};
