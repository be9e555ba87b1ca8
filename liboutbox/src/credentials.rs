//! Credential management for platform clients
//!
//! Two manager shapes, one per credential model:
//! - `XCredentialManager` — OAuth2 with rotating refresh tokens. Tokens
//!   are refreshed unconditionally before a client is handed out, so the
//!   sweep never starts with a token that is about to expire.
//! - `BlueskyCredentialManager` — session resumption. The stored session
//!   is resumed via `refreshSession`; a full password login only happens
//!   when resumption fails, and is bounded by a durable throttle.
//!
//! Neither manager holds authoritative state in memory: every token,
//! session, and throttle timestamp is a `settings` row, so a crash or a
//! concurrent process sees the same truth.
//!
//! # Example
//!
//! ```no_run
//! use liboutbox::credentials::XCredentialManager;
//! use liboutbox::config::XConfig;
//! use liboutbox::db::Database;
//!
//! # async fn example(db: Database, config: XConfig) -> liboutbox::error::Result<()> {
//! let manager = XCredentialManager::new(db, config)?;
//! let client = manager.client().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BlueskyConfig, XConfig};
use crate::db::Database;
use crate::error::{DbError, PlatformError, Result};
use crate::platforms::bluesky::BlueskyClient;
use crate::platforms::x::XClient;

// Settings keys. The credential managers are the only writers.
pub const X_ACCESS_TOKEN: &str = "x.access_token";
pub const X_REFRESH_TOKEN: &str = "x.refresh_token";
pub const X_TOKEN_EXPIRES_AT: &str = "x.token_expires_at";
pub const BLUESKY_SESSION: &str = "bluesky.session";
pub const BLUESKY_LOGIN_ATTEMPTS: &str = "bluesky.login_attempts";

/// Full password logins allowed per rolling hour.
pub const MAX_LOGIN_ATTEMPTS: usize = 5;
pub const LOGIN_ATTEMPT_WINDOW_SECS: i64 = 3600;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// An AT Protocol session as returned by `createSession` / `refreshSession`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueskySession {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub did: String,
    pub handle: String,
}

/// Hook invoked every time a Bluesky session rotates, including rotations
/// that happen mid-call inside the client. Implementations persist the
/// session; the trait exists so tests can observe rotations without a
/// database.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, session: &BlueskySession) -> Result<()>;
}

/// The production `SessionStore`: one JSON blob in the settings table.
pub struct DbSessionStore {
    db: Database,
}

impl DbSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn save_session(&self, session: &BlueskySession) -> Result<()> {
        let json = serde_json::to_string(session)
            .map_err(|e| DbError::Constraint(format!("session serialization failed: {}", e)))?;
        self.db.set_setting(BLUESKY_SESSION, &json).await
    }
}

/// Load the stored Bluesky session, if any. A corrupt blob is treated as
/// absent so a full login can replace it.
pub async fn load_bluesky_session(db: &Database) -> Result<Option<BlueskySession>> {
    let Some(json) = db.get_setting(BLUESKY_SESSION).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&json) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            warn!("stored bluesky session is corrupt, discarding: {}", e);
            db.delete_setting(BLUESKY_SESSION).await?;
            Ok(None)
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

/// OAuth2-refresh credential manager for X.
pub struct XCredentialManager {
    db: Database,
    config: XConfig,
    http: reqwest::Client,
}

impl XCredentialManager {
    pub fn new(db: Database, config: XConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { db, config, http })
    }

    /// Produce a client bound to a fresh access token.
    ///
    /// With a refresh token stored, the refresh happens unconditionally.
    /// On refresh success the rotated token pair replaces the stored one
    /// (X issues a new refresh token on every grant; reusing the old one
    /// fails). On a definitive refresh rejection both tokens are deleted
    /// and the account reports not-connected. With only an access token
    /// stored, the client is bound to it as-is and the API call decides.
    pub async fn client(&self) -> Result<XClient> {
        let refresh_token = self.db.get_setting(X_REFRESH_TOKEN).await?;

        match refresh_token {
            Some(refresh_token) => {
                let token = self.refresh(&refresh_token).await?;
                XClient::new(&self.config.api_base, &token)
            }
            None => {
                let Some(access_token) = self.db.get_setting(X_ACCESS_TOKEN).await? else {
                    return Err(PlatformError::NotAuthenticated(
                        "no stored X tokens".to_string(),
                    )
                    .into());
                };
                debug!("no X refresh token stored, using access token as-is");
                XClient::new(&self.config.api_base, &access_token)
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let response = self
            .http
            .post(format!(
                "{}/2/oauth2/token",
                self.config.api_base.trim_end_matches('/')
            ))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Transient(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let token: TokenResponse = response.json().await.map_err(|e| {
                PlatformError::Transient(format!("malformed token response: {}", e))
            })?;

            self.db
                .set_setting(X_ACCESS_TOKEN, &token.access_token)
                .await?;
            if let Some(new_refresh) = &token.refresh_token {
                self.db.set_setting(X_REFRESH_TOKEN, new_refresh).await?;
            }
            let expires_at = chrono::Utc::now().timestamp() + token.expires_in;
            self.db
                .set_setting(X_TOKEN_EXPIRES_AT, &expires_at.to_string())
                .await?;

            info!("X access token refreshed");
            Ok(token.access_token)
        } else if status.is_client_error() {
            // The refresh token is dead. Keeping it would make every
            // future sweep fail the same way, so disconnect the account.
            let body = response.text().await.unwrap_or_default();
            warn!("X refused token refresh ({}), disconnecting account", status);
            self.db.delete_setting(X_ACCESS_TOKEN).await?;
            self.db.delete_setting(X_REFRESH_TOKEN).await?;
            self.db.delete_setting(X_TOKEN_EXPIRES_AT).await?;
            Err(PlatformError::NotAuthenticated(format!(
                "X token refresh rejected: {}",
                body
            ))
            .into())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PlatformError::Transient(format!(
                "X token refresh returned {}: {}",
                status, body
            ))
            .into())
        }
    }
}

/// Session-resumption credential manager for Bluesky.
pub struct BlueskyCredentialManager {
    db: Database,
    config: BlueskyConfig,
    http: reqwest::Client,
}

impl BlueskyCredentialManager {
    pub fn new(db: Database, config: BlueskyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { db, config, http })
    }

    /// Produce a client bound to a live session.
    ///
    /// Resumption first: a stored session is refreshed via
    /// `refreshSession`, which costs nothing against the login limit. A
    /// full `createSession` login only runs when there is no session or
    /// resumption is rejected, and is bounded by the durable throttle.
    pub async fn client(&self) -> Result<BlueskyClient> {
        let store: Arc<dyn SessionStore> = Arc::new(DbSessionStore::new(self.db.clone()));

        if let Some(stored) = load_bluesky_session(&self.db).await? {
            match self.refresh_session(&stored).await {
                Ok(session) => {
                    store.save_session(&session).await?;
                    return BlueskyClient::new(&self.config.service, session, store);
                }
                Err(e) => {
                    debug!("bluesky session resumption failed, falling back to login: {}", e);
                }
            }
        }

        let session = self.login().await?;
        store.save_session(&session).await?;
        BlueskyClient::new(&self.config.service, session, store)
    }

    async fn refresh_session(&self, session: &BlueskySession) -> Result<BlueskySession> {
        let response = self
            .http
            .post(format!(
                "{}/xrpc/com.atproto.server.refreshSession",
                self.config.service.trim_end_matches('/')
            ))
            .bearer_auth(&session.refresh_jwt)
            .send()
            .await
            .map_err(|e| PlatformError::Transient(format!("refreshSession failed: {}", e)))?;

        if response.status().is_success() {
            let session: BlueskySession = response.json().await.map_err(|e| {
                PlatformError::Transient(format!("malformed refreshSession response: {}", e))
            })?;
            debug!(handle = %session.handle, "bluesky session resumed");
            Ok(session)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PlatformError::NotAuthenticated(format!(
                "refreshSession returned {}: {}",
                status, body
            ))
            .into())
        }
    }

    async fn login(&self) -> Result<BlueskySession> {
        let now = chrono::Utc::now().timestamp();
        self.check_login_throttle(now).await?;
        // The attempt counts whether or not it succeeds; a wrong password
        // must not allow unlimited retries.
        self.record_login_attempt(now).await?;

        let response = self
            .http
            .post(format!(
                "{}/xrpc/com.atproto.server.createSession",
                self.config.service.trim_end_matches('/')
            ))
            .json(&serde_json::json!({
                "identifier": self.config.identifier,
                "password": self.config.app_password,
            }))
            .send()
            .await
            .map_err(|e| PlatformError::Transient(format!("createSession failed: {}", e)))?;

        if response.status().is_success() {
            let session: BlueskySession = response.json().await.map_err(|e| {
                PlatformError::Transient(format!("malformed createSession response: {}", e))
            })?;
            info!(handle = %session.handle, "bluesky login succeeded");
            Ok(session)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PlatformError::NotAuthenticated(format!(
                "createSession returned {}: {}",
                status, body
            ))
            .into())
        }
    }

    /// Reject the login when the rolling-hour attempt limit is spent.
    pub async fn check_login_throttle(&self, now: i64) -> Result<()> {
        let attempts = self.recent_login_attempts(now).await?;
        if attempts.len() >= MAX_LOGIN_ATTEMPTS {
            return Err(PlatformError::NotAuthenticated(format!(
                "login throttled: {} attempts in the last hour",
                attempts.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Append `now` to the durable attempt log, pruning entries outside
    /// the rolling window.
    pub async fn record_login_attempt(&self, now: i64) -> Result<()> {
        let mut attempts = self.recent_login_attempts(now).await?;
        attempts.push(now);
        let json = serde_json::to_string(&attempts)
            .map_err(|e| DbError::Constraint(format!("attempt log serialization failed: {}", e)))?;
        self.db.set_setting(BLUESKY_LOGIN_ATTEMPTS, &json).await
    }

    async fn recent_login_attempts(&self, now: i64) -> Result<Vec<i64>> {
        let Some(json) = self.db.get_setting(BLUESKY_LOGIN_ATTEMPTS).await? else {
            return Ok(Vec::new());
        };
        let attempts: Vec<i64> = serde_json::from_str(&json).unwrap_or_default();
        let cutoff = now - LOGIN_ATTEMPT_WINDOW_SECS;
        Ok(attempts.into_iter().filter(|t| *t > cutoff).collect())
    }
}
