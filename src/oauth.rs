// ABOUTME: OAuth token validation, refresh, and .env persistence for both accounts
// ABOUTME: Implements the TokenGuard checks the coordinator runs before going online

use crate::config::Secrets;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use squawk_core::TokenGuard;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";
const REDIRECT_URI: &str = "http://localhost:8765/";

/// Below this remaining lifetime a token is refreshed proactively
const REFRESH_MARGIN_SECS: u64 = 3600;

/// The two token-holding accounts the bot operates with. The bot account
/// speaks in chat; the broadcaster account carries the channel-level grant
/// that event subscriptions authorize against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Account {
    Bot,
    Broadcaster,
}

impl Account {
    fn label(self) -> &'static str {
        match self {
            Account::Bot => "bot",
            Account::Broadcaster => "broadcaster",
        }
    }

    fn env_keys(self) -> (&'static str, &'static str) {
        match self {
            Account::Bot => ("BOT_ACCESS_TOKEN", "BOT_REFRESH_TOKEN"),
            Account::Broadcaster => ("BROADCASTER_ACCESS_TOKEN", "BROADCASTER_REFRESH_TOKEN"),
        }
    }
}

/// Successful response from the validate endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationInfo {
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

struct TokenPair {
    access: String,
    refresh: String,
}

/// Token store for both accounts, kept current against the OAuth endpoints.
///
/// Refreshed tokens are written back to the .env file so the next launch
/// starts from the newest pair.
pub struct TwitchTokens {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    bot: Mutex<TokenPair>,
    broadcaster: Mutex<TokenPair>,
    env_path: PathBuf,
}

impl TwitchTokens {
    pub fn new(secrets: &Secrets, env_path: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            bot: Mutex::new(TokenPair {
                access: secrets.bot_access_token.clone(),
                refresh: secrets.bot_refresh_token.clone(),
            }),
            broadcaster: Mutex::new(TokenPair {
                access: secrets.broadcaster_access_token.clone(),
                refresh: secrets.broadcaster_refresh_token.clone(),
            }),
            env_path: env_path.into(),
        }
    }

    fn pair(&self, account: Account) -> &Mutex<TokenPair> {
        match account {
            Account::Bot => &self.bot,
            Account::Broadcaster => &self.broadcaster,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn bot_access_token(&self) -> String {
        self.bot.lock().await.access.clone()
    }

    pub async fn broadcaster_access_token(&self) -> String {
        self.broadcaster.lock().await.access.clone()
    }

    /// Check a token against the validate endpoint. `Ok(None)` means the
    /// token was rejected; transport problems and unexpected statuses error.
    async fn validate(&self, token: &str) -> Result<Option<ValidationInfo>> {
        let response = self
            .http
            .get(VALIDATE_URL)
            .header(reqwest::header::AUTHORIZATION, format!("OAuth {}", token))
            .send()
            .await
            .context("Token validation request failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("Token validation returned {}", response.status());
        }
        let info = response
            .json::<ValidationInfo>()
            .await
            .context("Token validation response malformed")?;
        Ok(Some(info))
    }

    async fn validate_account(&self, account: Account) -> Result<Option<ValidationInfo>> {
        let token = self.pair(account).lock().await.access.clone();
        self.validate(&token).await
    }

    /// Exchange the refresh token for a new pair and persist it.
    async fn refresh(&self, account: Account) -> Result<()> {
        let refresh_token = self.pair(account).lock().await.refresh.clone();
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .context("Token refresh request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Token refresh for {} account failed: {} {}",
                account.label(),
                status,
                body
            );
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .context("Token refresh response malformed")?;

        {
            let mut pair = self.pair(account).lock().await;
            pair.access = refreshed.access_token.clone();
            pair.refresh = refreshed.refresh_token.clone();
        }
        let (access_key, refresh_key) = account.env_keys();
        update_env_file(&self.env_path, access_key, &refreshed.access_token)?;
        update_env_file(&self.env_path, refresh_key, &refreshed.refresh_token)?;
        tracing::info!(account = account.label(), "Access token refreshed and saved to .env");
        Ok(())
    }

    /// Authorization URL the channel owner must visit to grant `scopes`
    pub fn authorize_url(&self, scopes: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}",
            AUTHORIZE_URL,
            self.client_id,
            urlencoding::encode(REDIRECT_URI),
            urlencoding::encode(scopes)
        )
    }
}

#[async_trait]
impl TokenGuard for TwitchTokens {
    async fn ensure_valid_token(&self) -> Result<()> {
        if self.validate_account(Account::Bot).await?.is_some() {
            return Ok(());
        }
        tracing::warn!("Bot access token invalid, attempting refresh");
        self.refresh(Account::Bot).await?;
        if self.validate_account(Account::Bot).await?.is_none() {
            bail!("Bot token is still invalid after refresh; re-authorize the bot account");
        }
        tracing::info!("Refreshed bot token validated");
        Ok(())
    }

    async fn ensure_authorized_grant(&self, scopes: &str) -> Result<()> {
        let info = match self.validate_account(Account::Broadcaster).await? {
            Some(info) => info,
            None => {
                tracing::warn!("Broadcaster access token invalid, attempting refresh");
                self.refresh(Account::Broadcaster)
                    .await
                    .context("Broadcaster token refresh failed")?;
                let Some(info) = self.validate_account(Account::Broadcaster).await? else {
                    bail!(
                        "Broadcaster token is still invalid after refresh; re-authorize at: {}",
                        self.authorize_url(scopes)
                    );
                };
                info
            }
        };

        let missing = missing_scopes(scopes, &info.scopes);
        if !missing.is_empty() {
            bail!(
                "Broadcaster grant is missing scopes: {}. Re-authorize at: {}",
                missing.join(" "),
                self.authorize_url(scopes)
            );
        }
        tracing::debug!(login = %info.login, "Broadcaster grant covers all requested scopes");
        Ok(())
    }

    async fn refresh_if_needed(&self) -> Result<()> {
        for account in [Account::Bot, Account::Broadcaster] {
            if let Some(info) = self.validate_account(account).await? {
                if info.expires_in < REFRESH_MARGIN_SECS {
                    tracing::info!(
                        account = account.label(),
                        expires_in = info.expires_in,
                        "Token close to expiry, refreshing"
                    );
                    self.refresh(account).await?;
                }
            }
        }
        Ok(())
    }
}

/// Scopes in the requested string absent from the granted list
fn missing_scopes(requested: &str, granted: &[String]) -> Vec<String> {
    let granted: HashSet<&str> = granted.iter().map(|s| s.as_str()).collect();
    requested
        .split_whitespace()
        .filter(|scope| !granted.contains(scope))
        .map(|scope| scope.to_string())
        .collect()
}

/// Replace `KEY=...` in the env file (or append it), preserving other lines.
fn update_env_file(path: &Path, key: &str, value: &str) -> Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let updated = update_env_entry(&content, key, value);
    std::fs::write(path, updated).with_context(|| format!("Failed to write {}", path.display()))
}

fn update_env_entry(content: &str, key: &str, value: &str) -> String {
    let marker = format!("{}=", key);
    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    for line in content.lines() {
        if line.starts_with(&marker) {
            lines.push(format!("{}={}", key, value));
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.push(format!("{}={}", key, value));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
