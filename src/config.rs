// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use chrono::{DateTime, Utc};
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::{AccountId, StoredToken, TokenStatus};
use crate::cleaner::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY};
use crate::connection_pool::PoolConfig;
use crate::imap::oauth2::{OAuthClientConfig, OAuthProvider};
use crate::imap::{AuthType, ConnectionConfig};
use crate::net::ProxySettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout_secs: u64,
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.max_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..PoolConfig::default()
        }
    }

    /// Pool options for a run with `concurrency` folder workers: one session per worker.
    pub fn pool_config_for(&self, concurrency: usize) -> PoolConfig {
        PoolConfig {
            max_size: concurrency.max(1),
            ..self.pool_config()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerSettings {
    pub batch_size: i64,
    pub max_concurrency: i64,
}

/// One mailbox as configured on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    pub id: AccountId,
    pub email: String,
    /// `host` or `host:port`
    pub server: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub oauth_provider: Option<OAuthProvider>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl AccountSettings {
    /// Connection parameters without a token; OAuth2 accounts get theirs from the token manager.
    pub fn connection_config(&self) -> ConnectionConfig {
        match self.auth_type {
            AuthType::Password => ConnectionConfig::password(&self.server, &self.email, &self.password),
            AuthType::OAuth2 => ConnectionConfig {
                server: self.server.clone(),
                username: self.email.clone(),
                auth_type: AuthType::OAuth2,
                access_token: self.access_token.clone(),
                ..Default::default()
            },
        }
    }

    /// Initial token store entry for an OAuth2 account.
    pub fn stored_token(&self) -> Option<StoredToken> {
        if !self.auth_type.is_oauth2() {
            return None;
        }
        Some(StoredToken {
            access_token: self.access_token.clone().unwrap_or_default(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.token_expires_at,
            status: TokenStatus::Valid,
            error_message: None,
            client: OAuthClientConfig {
                provider: self.oauth_provider?,
                client_id: self.client_id.clone().unwrap_or_default(),
                client_secret: self.client_secret.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
    pub pool: PoolSettings,
    pub cleaner: CleanerSettings,
    #[serde(default)]
    pub accounts: Vec<AccountSettings>,
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl Settings {
    /// Loads defaults, then `config_path` (TOML) if given, then
    /// `MAILSWEEP_*` environment variables (`MAILSWEEP_POOL__MAX_SIZE=5`).
    pub fn new(config_path: Option<&str>) -> Result<Self, SettingsError> {
        let defaults = PoolConfig::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("proxy.type", "none")?
            .set_default("proxy.host", "")?
            .set_default("proxy.port", 0)?
            .set_default("proxy.enabled", false)?
            .set_default("pool.max_size", defaults.max_size as u64)?
            .set_default("pool.idle_timeout_secs", defaults.idle_timeout.as_secs())?
            .set_default("cleaner.batch_size", DEFAULT_BATCH_SIZE as i64)?
            .set_default("cleaner.max_concurrency", DEFAULT_MAX_CONCURRENCY as i64)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("MAILSWEEP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn account(&self, id: AccountId) -> Option<&AccountSettings> {
        self.accounts.iter().find(|a| a.id == id)
    }
}
