// ABOUTME: Command parsing and the case-insensitive command table
// ABOUTME: Handles prefix stripping, quoted arguments, and self/echo suppression

use crate::metrics;
use crate::traits::ChatLine;
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A parsed command from a chat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command name, lowercased, without prefix
    pub name: String,
    /// Parsed arguments (handles quoted strings)
    pub args: Vec<String>,
    /// The raw argument string after the command name
    pub raw_args: String,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>, raw_args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            raw_args: raw_args.into(),
        }
    }

    /// Get the first argument if present
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    /// Get an argument by index
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|s| s.as_str())
    }

    /// Check if the command has at least `count` arguments
    pub fn has_args(&self, count: usize) -> bool {
        self.args.len() >= count
    }
}

/// Result of parsing a chat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A command was recognized
    Command(Command),
    /// A regular chat line (not a command)
    Message(String),
    /// Empty input, nothing to do
    Ignore,
}

impl ParseResult {
    pub fn is_command(&self) -> bool {
        matches!(self, ParseResult::Command(_))
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }
}

/// Parse arguments from a string, respecting quoted strings
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parse a chat line against the command prefix.
///
/// A line is a command when it starts with `prefix` followed by an
/// alphabetic character. Anything else is a regular message. Case of the
/// command name is ignored; the parsed name comes back lowercased.
pub fn parse_line(body: &str, prefix: &str) -> ParseResult {
    let trimmed = body.trim();

    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    let Some(after_prefix) = trimmed.strip_prefix(prefix) else {
        return ParseResult::Message(trimmed.to_string());
    };
    if !after_prefix
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic())
    {
        return ParseResult::Message(trimmed.to_string());
    }

    let parts: Vec<&str> = after_prefix.splitn(2, char::is_whitespace).collect();
    let name = parts[0].to_lowercase();
    let raw_args = parts.get(1).map(|s| s.trim()).unwrap_or("").to_string();
    let args = parse_args(&raw_args);

    ParseResult::Command(Command::new(name, args, raw_args))
}

// =============================================================================
// Command Table
// =============================================================================

/// Boxed future returned by command handlers. `Ok(Some(text))` is sent back
/// to chat through the rate-limited path.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<String>>> + Send>>;

/// A registered command handler
pub type CommandHandler = Arc<dyn Fn(Command, ChatLine) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Command, ChatLine) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>>> + Send + 'static,
{
    Arc::new(move |cmd, line| Box::pin(f(cmd, line)))
}

struct CommandEntry {
    handler: CommandHandler,
    help: String,
}

/// Case-insensitive command table with self/echo suppression.
///
/// Registration is last-wins: re-registering a name replaces the previous
/// handler and help text. Commands are never removed while the bot runs.
pub struct Dispatcher {
    prefix: String,
    bot_login: String,
    commands: Mutex<HashMap<String, CommandEntry>>,
}

impl Dispatcher {
    pub fn new(prefix: impl Into<String>, bot_login: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bot_login: bot_login.into(),
            commands: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) a command under a case-insensitive name.
    pub async fn register(&self, name: &str, handler: CommandHandler, help: &str) {
        let key = name.to_lowercase();
        let entry = CommandEntry {
            handler,
            help: help.to_string(),
        };
        let mut commands = self.commands.lock().await;
        if commands.insert(key.clone(), entry).is_some() {
            tracing::debug!(command = %key, "Command re-registered, last registration wins");
        }
    }

    /// Match a line against the table: suppression checks, prefix parse,
    /// then lookup. `None` means the line needs no handling.
    pub async fn resolve(&self, line: &ChatLine) -> Option<(Command, CommandHandler)> {
        if line.echo || line.sender.login.eq_ignore_ascii_case(&self.bot_login) {
            return None;
        }

        let cmd = match parse_line(&line.text, &self.prefix) {
            ParseResult::Command(cmd) => cmd,
            _ => return None,
        };

        let commands = self.commands.lock().await;
        match commands.get(&cmd.name) {
            Some(entry) => {
                metrics::record_command(&cmd.name);
                Some((cmd, Arc::clone(&entry.handler)))
            }
            None => {
                tracing::debug!(command = %cmd.name, "Unknown command ignored");
                None
            }
        }
    }

    /// Registered command names, sorted
    pub async fn command_names(&self) -> Vec<String> {
        let commands = self.commands.lock().await;
        let mut names: Vec<String> = commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Help text for one command. The lookup tolerates a leading prefix,
    /// so `help !ping` and `help ping` are the same question.
    pub async fn help_for(&self, name: &str) -> Option<String> {
        let key = name
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(name)
            .to_lowercase();
        self.commands
            .lock()
            .await
            .get(&key)
            .map(|entry| format!("{}{}: {}", self.prefix, key, entry.help))
    }

    /// One-line summary of every registered command, for the help command
    pub async fn help_text(&self) -> String {
        let listed: Vec<String> = self
            .command_names()
            .await
            .iter()
            .map(|name| format!("{}{}", self.prefix, name))
            .collect();
        format!("Commands: {}", listed.join(" "))
    }

    pub async fn len(&self) -> usize {
        self.commands.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.commands.lock().await.is_empty()
    }
}
