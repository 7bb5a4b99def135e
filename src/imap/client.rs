// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session factory: dial, TLS, greeting, authenticate.

use std::sync::Arc;
use std::time::Duration;

use async_imap::Client as AsyncImapClient;
use async_trait::async_trait;
use log::{debug, info, warn};
use rustls::pki_types::ServerName as PkiServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::imap::error::ImapError;
use crate::imap::session::{AsyncImapSessionWrapper, MailSession, TlsCompatibleStream, TlsImapSession};
use crate::imap::types::ConnectionConfig;
use crate::imap::xoauth2::{XOAuth2Authenticator, MECHANISM as XOAUTH2};
use crate::net::proxy::Dialer;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Produces authenticated sessions for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, config: &ConnectionConfig) -> Result<Box<dyn MailSession>, ImapError>;
}

/// Builds a TLS connector trusting the platform root store, TLS 1.2 minimum.
pub fn tls_connector() -> Result<TlsConnector, ImapError> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| ImapError::Tls(format!("Failed to load native certificates: {}", e)))?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!("Loaded {} native certs, ignored {}.", added, ignored);
    if roots.is_empty() {
        warn!("Root certificate store is empty; TLS handshakes will fail.");
    }

    let config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Connects and authenticates, retrying the whole sequence with linear backoff.
pub async fn connect(
    config: &ConnectionConfig,
    dialer: &dyn Dialer,
    tls: &TlsConnector,
) -> Result<Box<dyn MailSession>, ImapError> {
    let prefix = config.log_prefix();
    let mut last_err = ImapError::Unknown("no connection attempt made".to_string());

    for attempt in 1..=CONNECT_ATTEMPTS {
        if attempt > 1 {
            let backoff = CONNECT_BACKOFF_STEP * (attempt - 1);
            debug!("{} Retrying connect in {:?} (attempt {}/{})", prefix, backoff, attempt, CONNECT_ATTEMPTS);
            sleep(backoff).await;
        }

        match connect_once(config, dialer, tls).await {
            Ok(session) => {
                info!("{} IMAP session established", prefix);
                return Ok(Box::new(AsyncImapSessionWrapper::new(session)));
            }
            Err(e) => {
                warn!("{} Connect attempt {}/{} failed: {}", prefix, attempt, CONNECT_ATTEMPTS, e);
                let retryable = is_retryable(&e);
                last_err = e;
                if !retryable {
                    break;
                }
            }
        }
    }

    Err(last_err)
}

/// Every failure of the connect sequence is retried except a malformed server name.
fn is_retryable(err: &ImapError) -> bool {
    !matches!(err, ImapError::Config(_))
}

/// Connects, authenticates and logs out again.
pub async fn test_connection(
    config: &ConnectionConfig,
    dialer: &dyn Dialer,
    tls: &TlsConnector,
) -> Result<(), ImapError> {
    let mut session = connect(config, dialer, tls).await?;
    if let Err(e) = session.logout().await {
        debug!("{} Logout after connection test failed: {}", config.log_prefix(), e);
    }
    Ok(())
}

async fn connect_once(
    config: &ConnectionConfig,
    dialer: &dyn Dialer,
    tls: &TlsConnector,
) -> Result<TlsImapSession, ImapError> {
    let (host, port) = config.host_port();
    let server_name = PkiServerName::try_from(host.clone())
        .map_err(|_| ImapError::Config(format!("Invalid server name: {}", host)))?;

    let address = format!("{}:{}", host, port);
    debug!("{} Dialing {}", config.log_prefix(), address);
    let tcp = dialer.dial(&address, DIAL_TIMEOUT).await?;

    let tls_stream = timeout(DIAL_TIMEOUT, tls.connect(server_name, tcp))
        .await
        .map_err(|_| ImapError::Timeout("TLS handshake".to_string()))?
        .map_err(|e| ImapError::Tls(e.to_string()))?;

    let mut client = AsyncImapClient::new(tls_stream.compat());
    read_greeting(&mut client).await?;
    authenticate(client, config).await
}

async fn read_greeting(client: &mut AsyncImapClient<TlsCompatibleStream>) -> Result<(), ImapError> {
    match timeout(AUTH_TIMEOUT, client.read_response()).await {
        Ok(Some(Ok(_greeting))) => Ok(()),
        Ok(Some(Err(e))) => Err(ImapError::Connection(format!("Failed to read greeting: {}", e))),
        Ok(None) => Err(ImapError::Connection("Connection closed before greeting".to_string())),
        Err(_) => Err(ImapError::Timeout("server greeting".to_string())),
    }
}

async fn authenticate(
    client: AsyncImapClient<TlsCompatibleStream>,
    config: &ConnectionConfig,
) -> Result<TlsImapSession, ImapError> {
    let result = if config.auth_type.is_oauth2() {
        let token = config
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ImapError::Auth("OAuth2 account has no access token".to_string()))?;
        let auth = XOAuth2Authenticator::new(&config.username, token);
        timeout(AUTH_TIMEOUT, client.authenticate(XOAUTH2, auth)).await
    } else {
        timeout(AUTH_TIMEOUT, client.login(&config.username, &config.password)).await
    };

    match result {
        Ok(Ok(session)) => Ok(session),
        // Dropping the returned client closes the transport.
        Ok(Err((e, _client))) => Err(ImapError::Auth(e.to_string())),
        Err(_) => Err(ImapError::Timeout("authentication".to_string())),
    }
}

/// Production [`ConnectionFactory`]: dials through `dialer` and shares one TLS config.
#[derive(Clone)]
pub struct ImapConnectionFactory {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
}

impl ImapConnectionFactory {
    pub fn new(dialer: Arc<dyn Dialer>) -> Result<Self, ImapError> {
        Ok(Self {
            dialer,
            tls: tls_connector()?,
        })
    }

    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<(), ImapError> {
        test_connection(config, self.dialer.as_ref(), &self.tls).await
    }
}

#[async_trait]
impl ConnectionFactory for ImapConnectionFactory {
    async fn create(&self, config: &ConnectionConfig) -> Result<Box<dyn MailSession>, ImapError> {
        connect(config, self.dialer.as_ref(), &self.tls).await
    }
}
