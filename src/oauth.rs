//! XOAUTH2 access-token cache
//!
//! One cache per process, shared by every worker. Refreshes are
//! serialized under the cache lock so concurrent callers for the same
//! account trigger a single request.

use crate::config::Account;
use crate::error::{SyncError, SyncResult};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

const GOOGLE_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v4/token";
const MICROSOFT_TOKEN_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/token";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

pub struct TokenManager {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager {
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The current access token for the account, refreshing if the cached
    /// one is missing or within a minute of expiry. Returns None for
    /// password-authenticated accounts.
    pub async fn token_for(&self, account: &Account) -> SyncResult<Option<String>> {
        let Some(refresh_token) = account.settings.refresh_token.clone() else {
            return Ok(None);
        };

        let mut cache = self.cache.lock().await;
        let now = Utc::now().timestamp();
        if let Some(cached) = cache.get(&account.id) {
            if cached.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(Some(cached.access_token.clone()));
            }
        }

        info!(account = %account.id, provider = %account.provider, "refreshing access token");
        let token = self.refresh(account, &refresh_token).await?;
        cache.insert(
            account.id.clone(),
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: now + token.expires_in.max(60),
            },
        );
        Ok(Some(token.access_token))
    }

    async fn refresh(&self, account: &Account, refresh_token: &str) -> SyncResult<TokenResponse> {
        let url = match account.provider.as_str() {
            "gmail" => GOOGLE_TOKEN_URL,
            "office365" | "outlook" => MICROSOFT_TOKEN_URL,
            other => {
                return Err(SyncError::authentication(format!(
                    "no token endpoint for provider {}",
                    other
                )))
            }
        };
        let client_id = account
            .settings
            .refresh_client_id
            .clone()
            .unwrap_or_default();

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id.as_str()),
        ];
        let response = self.client.post(url).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::authentication(format!(
                "token refresh failed ({}): {}",
                status, body
            )));
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    /// Drop the cached token so the next caller refreshes. Used when a
    /// server rejects a token the cache thought was fresh.
    pub async fn invalidate(&self, account_id: &str) {
        self.cache.lock().await.remove(account_id);
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}
