//! Upstream OAuth2 access token lifecycle.
//!
//! A single bearer token is cached in memory and persisted in the key/value
//! table, so restarts reuse a still-valid token. A token is considered expired
//! 30 seconds before its real expiry. Refreshes happen under the cache lock:
//! callers that find the token expired while a refresh is in flight wait for
//! it and reuse its result instead of calling the provider again.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::OAuthCredentials;
use crate::errors::AuthFailure;
use crate::metrics::ProxyMetrics;
use crate::store::SlugStore;
use crate::vault::TokenSealer;

/// Key under which the current token lives in the key/value table.
pub const ACCESS_TOKEN_KEY: &str = "upstream_access_token";

/// Tokens this close to expiry are treated as already expired.
pub const EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Expiry is measured from `started_at`, captured before the provider call.
    pub fn from_grant(grant: TokenGrant, started_at: DateTime<Utc>) -> Result<Self, AuthFailure> {
        if grant.expires_in <= 0 {
            return Err(AuthFailure::InvalidResponse(format!(
                "non-positive expires_in: {}",
                grant.expires_in
            )));
        }
        let expires_at = chrono::Duration::try_seconds(grant.expires_in)
            .and_then(|lifetime| started_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthFailure::InvalidResponse(format!(
                    "expires_in out of range: {}",
                    grant.expires_in
                ))
            })?;
        Ok(Self {
            token: grant.access_token,
            expires_at,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }

    /// Safe-to-log prefix of the token.
    pub fn preview(&self) -> String {
        let head: String = self.token.chars().take(8).collect();
        format!("{}…", head)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.preview())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
}

/// Anything that can hand out a currently valid upstream token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_valid_token(&self) -> Result<AccessToken, AuthFailure>;
}

pub struct TokenManager {
    http: reqwest::Client,
    endpoint: String,
    credentials: OAuthCredentials,
    store: SlugStore,
    sealer: Option<TokenSealer>,
    metrics: Option<ProxyMetrics>,
    current: Mutex<Option<AccessToken>>,
}

impl TokenManager {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: OAuthCredentials,
        store: SlugStore,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            credentials,
            store,
            sealer: None,
            metrics: None,
            current: Mutex::new(None),
        })
    }

    /// Seal the persisted token with the given key.
    pub fn with_sealer(mut self, sealer: TokenSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn with_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the cached token, refreshing it first if it is missing or
    /// within the expiry margin.
    pub async fn get_valid_token(&self) -> Result<AccessToken, AuthFailure> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.load_persisted().await?;
        }

        match current.as_ref() {
            Some(token) if !token.is_expired_at(Utc::now()) => {
                tracing::debug!(token = %token.preview(), "reusing access token");
                return Ok(token.clone());
            }
            Some(token) => {
                tracing::info!(token = %token.preview(), "access token about to expire");
            }
            None => tracing::info!("no access token cached"),
        }

        let fresh = self.refresh().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Refreshes unconditionally.
    pub async fn force_refresh(&self) -> Result<AccessToken, AuthFailure> {
        let mut current = self.current.lock().await;
        let fresh = self.refresh().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Cached or persisted token, without refreshing.
    pub async fn current(&self) -> Result<Option<AccessToken>, AuthFailure> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.load_persisted().await?;
        }
        Ok(current.clone())
    }

    async fn refresh(&self) -> Result<AccessToken, AuthFailure> {
        tracing::info!("refreshing access token");
        let started_at = Utc::now();

        let resp = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.token_refreshes_total.inc();
        }

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "token refresh failed");
            return Err(AuthFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let grant: TokenGrant = resp
            .json()
            .await
            .map_err(|e| AuthFailure::InvalidResponse(e.to_string()))?;
        let token = AccessToken::from_grant(grant, started_at)?;
        self.persist(&token).await?;

        tracing::info!(
            token = %token.preview(),
            expires_at = %token.expires_at,
            "got new access token"
        );
        Ok(token)
    }

    async fn load_persisted(&self) -> Result<Option<AccessToken>, AuthFailure> {
        let Some(raw) = self.store.kv_get(ACCESS_TOKEN_KEY).await? else {
            return Ok(None);
        };

        let json = match &self.sealer {
            Some(sealer) => match sealer.open(&raw) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("discarding persisted token that cannot be unsealed: {}", e);
                    return Ok(None);
                }
            },
            None => raw,
        };

        match serde_json::from_str::<AccessToken>(&json) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!("discarding unreadable persisted token: {}", e);
                Ok(None)
            }
        }
    }

    async fn persist(&self, token: &AccessToken) -> Result<(), AuthFailure> {
        let json =
            serde_json::to_string(token).map_err(|e| AuthFailure::Seal(e.to_string()))?;
        let value = match &self.sealer {
            Some(sealer) => sealer
                .seal(&json)
                .map_err(|e| AuthFailure::Seal(e.to_string()))?,
            None => json,
        };
        self.store.kv_set(ACCESS_TOKEN_KEY, &value).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn get_valid_token(&self) -> Result<AccessToken, AuthFailure> {
        TokenManager::get_valid_token(self).await
    }
}
