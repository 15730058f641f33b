use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use crate::config;
use crate::error::{SyncError, SyncResult};

/// Bearer credential held for the lifetime of the process. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub bearer_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("bearer_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Obtains and refreshes the bearer credential via the password grant.
///
/// The credential sits behind an async mutex that is held across the exchange, so two
/// callers never refresh at once even if the one-call-at-a-time rule is broken.
pub struct TokenManager {
    http: Client,
    token_url: Url,
    username: String,
    password: String,
    client_id: String,
    client_secret: String,
    scope: String,
    current: Mutex<Option<Credential>>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(
        token_url: Url,
        username: String,
        password: String,
        client_id: String,
        client_secret: String,
        scope: String,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .user_agent("apricot-sync/0.1")
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            token_url,
            username,
            password,
            client_id,
            client_secret,
            scope,
            current: Mutex::new(None),
        })
    }

    pub fn from_config(api: &config::Api) -> SyncResult<Self> {
        let token_url = Url::parse(&api.token_url)
            .map_err(|e| SyncError::Config(format!("api.token_url: {}", e)))?;
        Self::new(
            token_url,
            api.username.clone(),
            api.password.clone(),
            api.client_id.clone(),
            api.client_secret.clone(),
            api.scope.clone(),
        )
    }

    /// Return the held credential, re-authenticating first when none is held or it has expired.
    #[instrument(skip_all)]
    pub async fn ensure_valid_credential(&self) -> SyncResult<Credential> {
        let mut guard = self.current.lock().await;
        if let Some(cred) = guard.as_ref() {
            if !cred.is_expired_at(Utc::now()) {
                return Ok(cred.clone());
            }
            debug!(expired_at = %cred.expires_at, "bearer token expired; refreshing");
        }
        let fresh = self.authenticate().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the held credential so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    async fn authenticate(&self) -> SyncResult<Credential> {
        let form = [
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let res = self
            .http
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("token endpoint unreachable: {}", e)))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| SyncError::Auth(format!("failed to read token response: {}", e)))?;
        let token: TokenResponse = serde_json::from_str(&body).map_err(|_| {
            error!(%status, "malformed token response");
            SyncError::Auth(format!("malformed token response (HTTP {})", status))
        })?;

        if let Some(err) = token.error {
            let msg = match token.error_description {
                Some(desc) => format!("{}: {}", err, desc),
                None => err,
            };
            error!(%status, error = %msg, "token exchange rejected");
            return Err(SyncError::Auth(msg));
        }

        let (access_token, expires_in) = match (token.access_token, token.expires_in) {
            (Some(access_token), Some(expires_in)) if !access_token.is_empty() => {
                (access_token, expires_in)
            }
            _ => {
                return Err(SyncError::Auth(format!(
                    "token response without access_token/expires_in (HTTP {})",
                    status
                )))
            }
        };
        let expires_at = Duration::try_seconds(expires_in)
            .filter(|_| expires_in >= 0)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                error!(expires_in, "token lifetime out of range");
                SyncError::Auth(format!(
                    "malformed token response: expires_in {} out of range",
                    expires_in
                ))
            })?;
        debug!(expires_in, "obtained bearer token");
        Ok(Credential {
            bearer_token: access_token,
            expires_at,
        })
    }
}
