// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! OAuth2 refresh-token grant against Gmail and Outlook token endpoints.
//!
//! Only refreshing is handled here; the interactive authorization-code
//! exchange happens elsewhere and seeds the token store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::account::token::{TokenError, TokenRefreshClient};
use crate::net::proxy::ProxySettings;

const GMAIL_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OUTLOOK_TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
const OUTLOOK_SCOPES: &str = "https://outlook.office.com/IMAP.AccessAsUser.All offline_access";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Gmail,
    Outlook,
}

impl OAuthProvider {
    pub fn token_endpoint(&self) -> &'static str {
        match self {
            OAuthProvider::Gmail => GMAIL_TOKEN_URL,
            OAuthProvider::Outlook => OUTLOOK_TOKEN_URL,
        }
    }
}

/// Registered application credentials for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub provider: OAuthProvider,
    pub client_id: String,
    /// Gmail requires it; Outlook public clients have none.
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl OAuthClientConfig {
    fn refresh_form(&self, refresh_token: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("refresh_token", refresh_token.to_string()),
        ];
        match self.provider {
            OAuthProvider::Gmail => {
                if let Some(secret) = &self.client_secret {
                    form.push(("client_secret", secret.clone()));
                }
            }
            OAuthProvider::Outlook => form.push(("scope", OUTLOOK_SCOPES.to_string())),
        }
        form
    }
}

/// Token endpoint response; errors arrive in the same body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Defaults to one hour when the provider omits `expires_in`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in.unwrap_or(3600))
    }

    fn into_result(self) -> Result<TokenResponse, TokenError> {
        if let Some(code) = self.error.clone() {
            return Err(TokenError::Provider {
                error: code,
                description: self.error_description.clone().unwrap_or_default(),
            });
        }
        if self.access_token.is_empty() {
            return Err(TokenError::InvalidResponse("no access_token in response".to_string()));
        }
        Ok(self)
    }
}

/// `reqwest`-backed refresh client, proxied like the IMAP dialer.
#[derive(Debug, Clone)]
pub struct OAuth2RefreshClient {
    http_client: reqwest::Client,
}

impl OAuth2RefreshClient {
    pub fn new(proxy: &ProxySettings) -> Result<Self, TokenError> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
        if let Some(url) = proxy.url() {
            builder = builder.proxy(reqwest::Proxy::all(&url)?);
        }
        Ok(Self {
            http_client: builder.build()?,
        })
    }
}

#[async_trait]
impl TokenRefreshClient for OAuth2RefreshClient {
    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, TokenError> {
        let endpoint = client.provider.token_endpoint();
        debug!("Requesting token refresh from {}", endpoint);

        let response = self
            .http_client
            .post(endpoint)
            .form(&client.refresh_form(refresh_token))
            .send()
            .await?;
        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|e| {
            TokenError::InvalidResponse(format!("HTTP {}: {}", status, e))
        })?;

        match body.into_result() {
            Ok(token) => {
                info!(
                    "Token refreshed via {:?} (expires_in={:?}, new_refresh_token={})",
                    client.provider,
                    token.expires_in,
                    token.refresh_token.is_some()
                );
                Ok(token)
            }
            Err(e) => {
                error!("Token refresh via {:?} failed: {}", client.provider, e);
                Err(e)
            }
        }
    }
}
