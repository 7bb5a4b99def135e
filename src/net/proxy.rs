// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TCP dialing, directly or through a SOCKS5 / HTTP CONNECT proxy.

use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    None,
    Socks5,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    #[serde(rename = "type", default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub enabled: bool,
}

impl ProxySettings {
    pub fn is_active(&self) -> bool {
        self.enabled && self.proxy_type != ProxyType::None && !self.host.is_empty()
    }

    /// Proxy URL for HTTP clients, `None` when proxying is off.
    pub fn url(&self) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        let scheme = match self.proxy_type {
            ProxyType::Socks5 => "socks5",
            ProxyType::Http => "http",
            ProxyType::None => return None,
        };
        Some(format!("{}://{}:{}", scheme, self.host, self.port))
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens TCP streams to `host:port` addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str, dial_timeout: Duration) -> io::Result<TcpStream>;
}

/// Dials without any proxy.
#[derive(Debug, Default, Clone)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, address: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
        connect_with_timeout(address, dial_timeout).await
    }
}

/// Dialer honouring a live-updatable [`ProxySettings`].
#[derive(Debug, Clone, Default)]
pub struct ProxyDialer {
    settings: Arc<RwLock<ProxySettings>>,
}

impl ProxyDialer {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    /// Replaces the proxy settings; affects subsequent dials only.
    pub fn update(&self, settings: ProxySettings) {
        if let Some(url) = settings.url() {
            info!("Proxy settings updated: {}", url);
        } else {
            info!("Proxy disabled");
        }
        match self.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    pub fn settings(&self) -> ProxySettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial(&self, address: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
        let settings = self.settings();
        if !settings.is_active() {
            return connect_with_timeout(address, dial_timeout).await;
        }

        debug!("Dialing {} via {:?} proxy {}", address, settings.proxy_type, settings.address());
        let tunnel = async {
            let mut stream = TcpStream::connect(settings.address()).await?;
            match settings.proxy_type {
                ProxyType::Socks5 => socks5_connect(&mut stream, address).await?,
                ProxyType::Http => http_connect(&mut stream, address).await?,
                ProxyType::None => {}
            }
            Ok::<_, io::Error>(stream)
        };
        timeout(dial_timeout, tunnel)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("proxy dial to {} timed out", address)))?
    }
}

async fn connect_with_timeout(address: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
    timeout(dial_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial to {} timed out", address)))?
}

fn split_address(address: &str) -> io::Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("missing port in {}", address)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad port in {}", address)))?;
    Ok((host, port))
}

/// SOCKS5 CONNECT without authentication, target passed as a domain name.
async fn socks5_connect(stream: &mut TcpStream, address: &str) -> io::Result<()> {
    let (host, port) = split_address(address)?;
    if host.len() > 255 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "host name too long for SOCKS5"));
    }

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(io::Error::new(io::ErrorKind::Other, "SOCKS5 proxy refused no-auth method"));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("SOCKS5 connect failed with reply code {}", head[1]),
        ));
    }
    // Drain the bound address.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("SOCKS5 reply has unknown address type {}", other),
            ))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

/// HTTP CONNECT tunnel; succeeds only on a 200 status.
async fn http_connect(stream: &mut TcpStream, address: &str) -> io::Result<()> {
    let request = format!(
        "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
        addr = address
    );
    stream.write_all(request.as_bytes()).await?;

    // Read byte-wise so nothing past the header block is consumed.
    let mut header = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() > 8192 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "proxy response header too large"));
        }
        stream.read_exact(&mut byte).await?;
        header.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("HTTP proxy returned: {}", status_line),
        ));
    }
    Ok(())
}
