// ABOUTME: Twitch glue around the squawk-core runtime
// ABOUTME: Config, tokens, Helix REST, the EventSub websocket, and built-in addons

pub mod addons;
pub mod chat;
pub mod config;
pub mod eventsub;
pub mod helix;
pub mod oauth;

pub use chat::TwitchChat;
pub use config::{Config, Secrets};
pub use eventsub::EventSubFeed;
pub use helix::HelixClient;
pub use oauth::TwitchTokens;
