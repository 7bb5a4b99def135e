// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! OAuth2 access-token lifecycle.
//!
//! [`TokenManager::access_token`] returns a token valid for at least the
//! refresh margin, refreshing it when needed. Refreshes for one account are
//! serialized by a per-account lock with a double check, so concurrent
//! callers share a single outbound refresh.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, RwLock};

use crate::account::AccountId;
use crate::imap::oauth2::{OAuthClientConfig, TokenResponse};
use crate::imap::types::TokenRefresher;

/// Tokens expiring within this window are refreshed.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("No OAuth2 token stored for account {0}; authorization required")]
    NotFound(AccountId),

    #[error("Token expired, re-authorization required: {0}")]
    ReauthorizationRequired(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token request failed: {error} - {description}")]
    Provider { error: String, description: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Token store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    #[default]
    Valid,
    Expired,
}

/// Persisted token state for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TokenStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub client: OAuthClientConfig,
}

impl StoredToken {
    /// True when the token stays valid for longer than `margin`. Unknown expiry counts as stale.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.status == TokenStatus::Valid
            && self.expires_at.map_or(false, |exp| exp - now > margin)
    }

    fn apply_refresh(&mut self, response: TokenResponse, now: DateTime<Utc>) {
        self.expires_at = Some(response.expires_at(now));
        self.access_token = response.access_token;
        // Providers may omit the refresh token; the old one stays valid then.
        if let Some(rt) = response.refresh_token.filter(|rt| !rt.is_empty()) {
            self.refresh_token = Some(rt);
        }
        self.status = TokenStatus::Valid;
        self.error_message = None;
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, account_id: AccountId) -> Result<Option<StoredToken>, TokenError>;
    async fn save(&self, account_id: AccountId, token: StoredToken) -> Result<(), TokenError>;
    async fn mark_expired(&self, account_id: AccountId, reason: &str) -> Result<(), TokenError>;
}

/// Process-local [`TokenStore`].
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<AccountId, StoredToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, account_id: AccountId) -> Result<Option<StoredToken>, TokenError> {
        Ok(self.tokens.read().await.get(&account_id).cloned())
    }

    async fn save(&self, account_id: AccountId, token: StoredToken) -> Result<(), TokenError> {
        self.tokens.write().await.insert(account_id, token);
        Ok(())
    }

    async fn mark_expired(&self, account_id: AccountId, reason: &str) -> Result<(), TokenError> {
        if let Some(token) = self.tokens.write().await.get_mut(&account_id) {
            token.status = TokenStatus::Expired;
            token.error_message = Some(reason.to_string());
        }
        Ok(())
    }
}

/// Performs the refresh-token grant against a provider.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenRefreshClient: Send + Sync {
    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, TokenError>;
}

pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn TokenRefreshClient>,
    // Entries are created lazily and never removed.
    locks: DashMap<AccountId, Arc<TokioMutex<()>>>,
    margin: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, client: Arc<dyn TokenRefreshClient>) -> Self {
        Self {
            store,
            client,
            locks: DashMap::new(),
            margin: Duration::minutes(REFRESH_MARGIN_MINUTES),
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    fn account_lock(&self, account_id: AccountId) -> Arc<TokioMutex<()>> {
        self.locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Returns a usable access token, refreshing it if it expires within the margin.
    pub async fn access_token(&self, account_id: AccountId) -> Result<String, TokenError> {
        let token = self
            .store
            .load(account_id)
            .await?
            .ok_or(TokenError::NotFound(account_id))?;
        if token.is_fresh(Utc::now(), self.margin) {
            return Ok(token.access_token);
        }

        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let mut token = self
            .store
            .load(account_id)
            .await?
            .ok_or(TokenError::NotFound(account_id))?;
        if token.is_fresh(Utc::now(), self.margin) {
            debug!("Token for account {} already refreshed by another task", account_id);
            return Ok(token.access_token);
        }

        let Some(refresh_token) = token.refresh_token.clone().filter(|rt| !rt.is_empty()) else {
            let reason = "refresh token missing, re-authorization required";
            self.store.mark_expired(account_id, reason).await?;
            return Err(TokenError::ReauthorizationRequired(reason.to_string()));
        };

        info!("Refreshing OAuth2 token for account {} ({:?})", account_id, token.client.provider);
        match self.client.refresh(&token.client, &refresh_token).await {
            Ok(response) => {
                token.apply_refresh(response, Utc::now());
                let access_token = token.access_token.clone();
                self.store.save(account_id, token).await?;
                Ok(access_token)
            }
            Err(e) => {
                warn!("Token refresh for account {} failed: {}", account_id, e);
                self.store.mark_expired(account_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Callback for [`crate::imap::types::ConnectionConfig::token_refresher`].
    pub fn refresher(self: &Arc<Self>, account_id: AccountId) -> TokenRefresher {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.access_token(account_id).await })
        })
    }
}
