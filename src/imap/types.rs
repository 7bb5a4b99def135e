// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::account::token::TokenError;

/// Default IMAPS port used when the server string carries none.
pub const DEFAULT_IMAPS_PORT: u16 = 993;

/// Zero-argument callback yielding a fresh OAuth2 access token.
pub type TokenRefresher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, TokenError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Password,
    #[serde(alias = "oauth2-auth-code", alias = "oauth2-client-creds")]
    OAuth2,
}

impl AuthType {
    pub fn is_oauth2(&self) -> bool {
        matches!(self, AuthType::OAuth2)
    }
}

/// Per-account dial and authentication parameters.
#[derive(Clone, Default)]
pub struct ConnectionConfig {
    /// `host` or `host:port`
    pub server: String,
    pub username: String,
    pub password: String,
    pub auth_type: AuthType,
    pub access_token: Option<String>,
    pub token_refresher: Option<TokenRefresher>,
}

impl ConnectionConfig {
    pub fn password(server: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            auth_type: AuthType::Password,
            ..Default::default()
        }
    }

    pub fn oauth2(server: impl Into<String>, username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            auth_type: AuthType::OAuth2,
            access_token: Some(access_token.into()),
            ..Default::default()
        }
    }

    pub fn with_refresher(mut self, refresher: TokenRefresher) -> Self {
        self.token_refresher = Some(refresher);
        self
    }

    /// Splits `server` into host and port, defaulting to 993.
    pub fn host_port(&self) -> (String, u16) {
        if let Some((host, port)) = self.server.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.server.clone(), DEFAULT_IMAPS_PORT)
    }

    /// `[user@server]`, used to prefix log lines.
    pub fn log_prefix(&self) -> String {
        format!("[{}@{}]", self.username, self.server)
    }

    /// Two configs address the same mailbox when server and username match.
    pub fn same_account(&self, other: &ConnectionConfig) -> bool {
        self.server == other.server && self.username == other.username
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_token_refresher", &self.token_refresher.is_some())
            .finish()
    }
}

/// Result of selecting a folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub exists: u32,
}

/// Sender and subject of one message, decoded for matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeSummary {
    pub uid: u32,
    /// `mailbox@host` of each From address
    pub from: Vec<String>,
    pub subject: Option<String>,
}
