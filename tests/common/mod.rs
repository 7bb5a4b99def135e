// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scripted in-memory IMAP server shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mailsweep::imap::{ConnectionConfig, ConnectionFactory, EnvelopeSummary, ImapError, MailSession, MailboxInfo};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub uid: u32,
    pub from: String,
    pub subject: String,
    pub deleted: bool,
}

/// Mailbox contents plus failure injection and call counters.
#[derive(Default)]
pub struct MockServer {
    folders: Mutex<HashMap<String, Vec<MockMessage>>>,
    pub searches: Mutex<Vec<String>>,
    pub fetch_calls: AtomicUsize,
    pub store_calls: AtomicUsize,
    pub expunge_calls: AtomicUsize,
    pub noop_calls: AtomicUsize,
    pub logouts: AtomicUsize,
    /// NOOP fails while set
    pub fail_noop: AtomicBool,
    /// The next N STORE commands fail with a connection error
    pub fail_stores: AtomicUsize,
    /// SEARCH with FROM or SUBJECT returns nothing, like servers that cannot evaluate them
    pub no_text_search: AtomicBool,
    /// Delay added to each STORE
    pub store_delay: Mutex<Duration>,
    /// Delay added to each NOOP
    pub noop_delay: Mutex<Duration>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Folder with UIDs `1..=count`, every message from `sender`.
    pub fn add_folder(&self, name: &str, count: u32, sender: &str) {
        let messages = (1..=count)
            .map(|uid| MockMessage {
                uid,
                from: sender.to_string(),
                subject: format!("Message {}", uid),
                deleted: false,
            })
            .collect();
        self.folders.lock().unwrap().insert(name.to_string(), messages);
    }

    pub fn add_message(&self, folder: &str, uid: u32, from: &str, subject: &str) {
        self.folders
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .push(MockMessage {
                uid,
                from: from.to_string(),
                subject: subject.to_string(),
                deleted: false,
            });
    }

    pub fn message_count(&self, folder: &str) -> usize {
        self.folders.lock().unwrap().get(folder).map_or(0, |m| m.len())
    }

    pub fn remaining_uids(&self, folder: &str) -> Vec<u32> {
        self.folders
            .lock()
            .unwrap()
            .get(folder)
            .map(|m| m.iter().map(|msg| msg.uid).collect())
            .unwrap_or_default()
    }

    pub fn set_store_delay(&self, delay: Duration) {
        *self.store_delay.lock().unwrap() = delay;
    }

    pub fn set_noop_delay(&self, delay: Duration) {
        *self.noop_delay.lock().unwrap() = delay;
    }
}

pub struct MockSession {
    server: Arc<MockServer>,
    selected: Option<String>,
}

impl MockSession {
    pub fn new(server: Arc<MockServer>) -> Self {
        Self { server, selected: None }
    }

    fn selected(&self) -> Result<String, ImapError> {
        self.selected
            .clone()
            .ok_or_else(|| ImapError::BadResponse("no folder selected".to_string()))
    }
}

#[async_trait]
impl MailSession for MockSession {
    async fn select_folder(&mut self, name: &str) -> Result<MailboxInfo, ImapError> {
        let folders = self.server.folders.lock().unwrap();
        let messages = folders
            .get(name)
            .ok_or_else(|| ImapError::No(format!("Mailbox doesn't exist: {}", name)))?;
        let exists = messages.len() as u32;
        drop(folders);
        self.selected = Some(name.to_string());
        Ok(MailboxInfo {
            name: name.to_string(),
            exists,
        })
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, ImapError> {
        let folder = self.selected()?;
        self.server.searches.lock().unwrap().push(query.to_string());
        if self.server.no_text_search.load(Ordering::SeqCst)
            && (query.contains("FROM") || query.contains("SUBJECT"))
        {
            return Ok(Vec::new());
        }
        let folders = self.server.folders.lock().unwrap();
        let mut uids: Vec<u32> = folders
            .get(&folder)
            .map(|m| m.iter().filter(|msg| !msg.deleted).map(|msg| msg.uid).collect())
            .unwrap_or_default();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_envelopes(&mut self, uids: &[u32]) -> Result<Vec<EnvelopeSummary>, ImapError> {
        let folder = self.selected()?;
        self.server.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let folders = self.server.folders.lock().unwrap();
        Ok(folders
            .get(&folder)
            .map(|m| {
                m.iter()
                    .filter(|msg| uids.contains(&msg.uid))
                    .map(|msg| EnvelopeSummary {
                        uid: msg.uid,
                        from: vec![msg.from.clone()],
                        subject: Some(msg.subject.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_deleted(&mut self, uids: &[u32]) -> Result<(), ImapError> {
        let folder = self.selected()?;
        self.server.store_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.server.store_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let injected = self
            .server
            .fail_stores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ImapError::Connection("connection reset by peer".to_string()));
        }

        let mut folders = self.server.folders.lock().unwrap();
        if let Some(messages) = folders.get_mut(&folder) {
            for msg in messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                msg.deleted = true;
            }
        }
        Ok(())
    }

    async fn expunge(&mut self) -> Result<(), ImapError> {
        let folder = self.selected()?;
        self.server.expunge_calls.fetch_add(1, Ordering::SeqCst);
        let mut folders = self.server.folders.lock().unwrap();
        if let Some(messages) = folders.get_mut(&folder) {
            messages.retain(|m| !m.deleted);
        }
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), ImapError> {
        self.server.noop_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.server.noop_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.server.fail_noop.load(Ordering::SeqCst) {
            return Err(ImapError::Connection("socket closed".to_string()));
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.server.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockSession`]s over one [`MockServer`].
pub struct MockFactory {
    pub server: Arc<MockServer>,
    pub created: AtomicUsize,
    /// The next N creations fail
    pub fail_creates: AtomicUsize,
    pub create_delay: Duration,
    /// Usernames seen by `create`
    pub usernames: Mutex<Vec<String>>,
    /// Access tokens seen by `create`
    pub tokens: Mutex<Vec<Option<String>>>,
}

impl MockFactory {
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self::with_delay(server, Duration::ZERO))
    }

    pub fn with_delay(server: Arc<MockServer>, create_delay: Duration) -> Self {
        Self {
            server,
            created: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            create_delay,
            usernames: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self, config: &ConnectionConfig) -> Result<Box<dyn MailSession>, ImapError> {
        if !self.create_delay.is_zero() {
            sleep(self.create_delay).await;
        }
        let injected = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ImapError::Connection("connection refused".to_string()));
        }
        self.usernames.lock().unwrap().push(config.username.clone());
        self.tokens.lock().unwrap().push(config.access_token.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession::new(Arc::clone(&self.server))))
    }
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::password("imap.example.com", "user@example.com", "secret")
}
