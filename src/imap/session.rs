// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use async_imap::types::Fetch;
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use log::debug;
use tokio::net::TcpStream as TokioTcpStream;
use tokio::time::timeout;
use tokio_util::compat::Compat;

use crate::imap::error::ImapError;
use crate::imap::types::{EnvelopeSummary, MailboxInfo};
use crate::utils::mime_decoder::decode_mime_header;

// Type aliases
pub type TlsCompatibleStream = Compat<tokio_rustls::client::TlsStream<TokioTcpStream>>;
pub type TlsImapSession = async_imap::Session<TlsCompatibleStream>;

/// How long a best-effort LOGOUT may take when a session is discarded.
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// One authenticated, stateful IMAP session.
///
/// Borrowers own the session exclusively, so every operation takes `&mut self`.
#[async_trait]
pub trait MailSession: Send + Sync {
    /// Selects a folder read-write.
    async fn select_folder(&mut self, name: &str) -> Result<MailboxInfo, ImapError>;

    /// Runs `UID SEARCH` with a rendered criteria string.
    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, ImapError>;

    /// Fetches the envelope of each UID in the selected folder.
    async fn fetch_envelopes(&mut self, uids: &[u32]) -> Result<Vec<EnvelopeSummary>, ImapError>;

    /// Adds `\Deleted` to the given UIDs.
    async fn mark_deleted(&mut self, uids: &[u32]) -> Result<(), ImapError>;

    /// Permanently removes messages flagged `\Deleted`.
    async fn expunge(&mut self) -> Result<(), ImapError>;

    /// Lightweight round-trip used as a liveness probe.
    async fn noop(&mut self) -> Result<(), ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;
}

/// Logs a discarded session out, bounded by [`LOGOUT_TIMEOUT`]. Errors are ignored.
pub async fn close_session(mut session: Box<dyn MailSession>) {
    match timeout(LOGOUT_TIMEOUT, session.logout()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Logout failed while closing session: {}", e),
        Err(_) => debug!("Logout timed out while closing session"),
    }
}

/// Renders UIDs as a compact IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range_part(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_part(start, end));
    parts.join(",")
}

fn range_part(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// async-imap backed [`MailSession`].
pub struct AsyncImapSessionWrapper {
    session: TlsImapSession,
}

impl AsyncImapSessionWrapper {
    pub fn new(session: TlsImapSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MailSession for AsyncImapSessionWrapper {
    async fn select_folder(&mut self, name: &str) -> Result<MailboxInfo, ImapError> {
        let mailbox = self.session.select(name).await?;
        Ok(MailboxInfo {
            name: name.to_string(),
            exists: mailbox.exists,
        })
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, ImapError> {
        let found = self.session.uid_search(query).await?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_envelopes(&mut self, uids: &[u32]) -> Result<Vec<EnvelopeSummary>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(uid_set(uids), "(UID ENVELOPE)")
            .await?
            .try_collect()
            .await?;
        Ok(fetches.iter().filter_map(envelope_summary).collect())
    }

    async fn mark_deleted(&mut self, uids: &[u32]) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        let _: Vec<Fetch> = self
            .session
            .uid_store(uid_set(uids), "+FLAGS.SILENT (\\Deleted)")
            .await?
            .try_collect()
            .await?;
        Ok(())
    }

    async fn expunge(&mut self) -> Result<(), ImapError> {
        let _: Vec<u32> = self.session.expunge().await?.try_collect().await?;
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), ImapError> {
        self.session.noop().await.map_err(ImapError::from)
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.session.logout().await.map_err(ImapError::from)
    }
}

fn envelope_summary(fetch: &Fetch) -> Option<EnvelopeSummary> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let from = envelope
        .from
        .as_ref()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|addr| {
                    let mailbox = addr.mailbox.as_ref()?;
                    let mailbox = String::from_utf8_lossy(mailbox);
                    match addr.host.as_ref() {
                        Some(host) => Some(format!("{}@{}", mailbox, String::from_utf8_lossy(host))),
                        None => Some(mailbox.into_owned()),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let subject = envelope
        .subject
        .as_ref()
        .map(|raw| decode_mime_header(&String::from_utf8_lossy(raw)));

    Some(EnvelopeSummary { uid, from, subject })
}
