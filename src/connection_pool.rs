// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bounded pool of authenticated IMAP sessions for one account.
//!
//! A borrower owns its [`PooledSession`] exclusively and hands it back with
//! [`ConnectionPool::release`] or [`ConnectionPool::mark_bad`]. Idle sessions
//! are probed with `NOOP` before reuse and evicted after the idle timeout.
//! All state transitions happen under one lock; probes, session creation and
//! LOGOUT run with the lock released. A handle dropped without being handed
//! back (a panicked or aborted borrower) frees its slot on drop.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::time::{sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::imap::client::ConnectionFactory;
use crate::imap::session::{close_session, MailSession};
use crate::imap::{ConnectionConfig, ImapError, TokenRefresher};

/// Errors that can occur during pool operations
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("Connection pool is closed")]
    Closed,
    #[error("Acquire cancelled")]
    Cancelled,
    #[error("Timed out after {0:?} waiting for a pooled session")]
    Timeout(Duration),
    #[error("Failed to create connection: {0}")]
    ConnectionFailed(#[from] ImapError),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of sessions, idle and in use together
    pub max_size: usize,
    /// Idle sessions older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// Overall bound on waiting for capacity
    pub acquire_timeout: Duration,
    /// Bound on the `NOOP` liveness probe
    pub health_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 3,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub creating: usize,
    pub max_size: usize,
    pub created: u64,
    pub reused: u64,
    pub health_failures: u64,
}

/// Claim on a borrowed entry. Dropped while still armed, it evicts the
/// entry so the slot is not lost.
struct Lease {
    id: Uuid,
    pool: Weak<ConnectionPool>,
    armed: bool,
}

impl Lease {
    fn new(pool: &ConnectionPool, id: Uuid) -> Self {
        Self {
            id,
            pool: pool.self_ref.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let id = self.id;
        warn!("Session {} dropped without release, freeing its slot", id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.forget(id).await });
            }
            Err(_) => {
                if let Ok(mut state) = pool.state.try_lock() {
                    state.remove(id);
                }
                pool.notify.notify_waiters();
            }
        }
    }
}

/// A borrowed session. Derefs to the underlying [`MailSession`].
pub struct PooledSession {
    id: Uuid,
    session: Box<dyn MailSession>,
    created_at: Instant,
    lease: Lease,
}

impl PooledSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl Deref for PooledSession {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// Bookkeeping for one tracked session; `session` is `None` while borrowed.
struct SessionEntry {
    id: Uuid,
    created_at: Instant,
    last_used: Instant,
    session: Option<Box<dyn MailSession>>,
}

impl SessionEntry {
    fn in_use(&self) -> bool {
        self.session.is_none()
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<SessionEntry>,
    closed: bool,
    created: u64,
    reused: u64,
    health_failures: u64,
}

impl PoolState {
    fn remove(&mut self, id: Uuid) -> Option<SessionEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.swap_remove(pos))
    }
}

/// Reserved creation capacity, returned on drop even if the acquire future is abandoned.
struct CreationSlot<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        self.pool.creating.fetch_sub(1, Ordering::SeqCst);
        self.pool.notify.notify_waiters();
    }
}

pub struct ConnectionPool {
    self_ref: Weak<ConnectionPool>,
    state: TokioMutex<PoolState>,
    notify: Notify,
    creating: AtomicUsize,
    connection: RwLock<ConnectionConfig>,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(
        connection: ConnectionConfig,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Arc<Self> {
        debug!(
            "{} Creating connection pool (max_size={}, idle_timeout={:?})",
            connection.log_prefix(),
            config.max_size,
            config.idle_timeout
        );
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            state: TokioMutex::new(PoolState::default()),
            notify: Notify::new(),
            creating: AtomicUsize::new(0),
            connection: RwLock::new(connection),
            factory,
            config,
        })
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    /// Snapshot of the current connection parameters.
    pub fn connection_config(&self) -> ConnectionConfig {
        match self.connection.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_connection_mut(&self, f: impl FnOnce(&mut ConnectionConfig)) {
        match self.connection.write() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    /// Replaces the token fields; existing sessions are kept.
    pub fn update_credentials(&self, access_token: Option<String>, refresher: Option<TokenRefresher>) {
        self.with_connection_mut(|cfg| {
            cfg.access_token = access_token;
            cfg.token_refresher = refresher;
        });
    }

    fn log_prefix(&self) -> String {
        self.connection_config().log_prefix()
    }

    /// Borrows a healthy session, creating one when below capacity and
    /// otherwise waiting up to the acquire timeout.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledSession, PoolError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            let mut state = self.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }

            // 1. Reuse an idle session, evicting stale ones on the way.
            let mut stale = Vec::new();
            let mut candidate = None;
            let mut i = 0;
            while i < state.entries.len() {
                let entry = &mut state.entries[i];
                if entry.in_use() {
                    i += 1;
                    continue;
                }
                if entry.last_used.elapsed() > self.config.idle_timeout {
                    let entry = state.entries.swap_remove(i);
                    stale.extend(entry.session);
                    continue;
                }
                candidate = entry.session.take().map(|s| (entry.id, entry.created_at, s));
                break;
            }

            if let Some((id, created_at, mut session)) = candidate {
                let lease = Lease::new(self, id);
                drop(state);
                self.discard(stale);

                let healthy = matches!(
                    timeout(self.config.health_check_timeout, session.noop()).await,
                    Ok(Ok(()))
                );

                let mut state = self.state.lock().await;
                if state.closed {
                    lease.disarm();
                    state.remove(id);
                    drop(state);
                    close_session(session).await;
                    return Err(PoolError::Closed);
                }
                if !healthy {
                    lease.disarm();
                    state.health_failures += 1;
                    state.remove(id);
                    drop(state);
                    warn!("{} Pooled session {} failed health check, discarding", self.log_prefix(), id);
                    self.discard(vec![session]);
                    self.notify.notify_waiters();
                    continue;
                }
                if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                    entry.last_used = Instant::now();
                }
                state.reused += 1;
                debug!("{} Reusing pooled session {}", self.log_prefix(), id);
                return Ok(PooledSession {
                    id,
                    session,
                    created_at,
                    lease,
                });
            }

            // 2. Create a new session if there is room.
            if state.entries.len() + self.creating.load(Ordering::SeqCst) < self.config.max_size {
                self.creating.fetch_add(1, Ordering::SeqCst);
                let slot = CreationSlot { pool: self };
                drop(state);
                self.discard(stale);

                let result = self.create_session().await;

                let mut state = self.state.lock().await;
                drop(slot);
                let session = result?;
                if state.closed {
                    drop(state);
                    close_session(session).await;
                    return Err(PoolError::Closed);
                }
                let now = Instant::now();
                let id = Uuid::new_v4();
                state.entries.push(SessionEntry {
                    id,
                    created_at: now,
                    last_used: now,
                    session: None,
                });
                state.created += 1;
                info!(
                    "{} Created pooled session {} ({}/{})",
                    self.log_prefix(),
                    id,
                    state.entries.len(),
                    self.config.max_size
                );
                return Ok(PooledSession {
                    id,
                    session,
                    created_at: now,
                    lease: Lease::new(self, id),
                });
            }

            // 3. At capacity: wait for a release, the deadline or cancellation.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);
            self.discard(stale);

            tokio::select! {
                _ = notified => continue,
                _ = sleep_until(deadline) => {
                    warn!("{} Timed out waiting for a pooled session", self.log_prefix());
                    return Err(PoolError::Timeout(self.config.acquire_timeout));
                }
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            }
        }
    }

    async fn create_session(&self) -> Result<Box<dyn MailSession>, ImapError> {
        let mut config = self.connection_config();
        if config.auth_type.is_oauth2() {
            if let Some(refresher) = config.token_refresher.clone() {
                match refresher().await {
                    Ok(token) => {
                        self.with_connection_mut(|cfg| cfg.access_token = Some(token.clone()));
                        config.access_token = Some(token);
                    }
                    Err(e) => warn!(
                        "{} Token refresh before connect failed, using current token: {}",
                        config.log_prefix(),
                        e
                    ),
                }
            }
        }
        self.factory.create(&config).await
    }

    /// Returns a borrowed session to the idle set.
    pub async fn release(&self, handle: PooledSession) {
        let PooledSession { id, session, lease, .. } = handle;
        lease.disarm();
        let mut state = self.state.lock().await;
        let entry = if state.closed {
            None
        } else {
            state.entries.iter_mut().find(|e| e.id == id)
        };
        match entry {
            Some(entry) => {
                entry.last_used = Instant::now();
                entry.session = Some(session);
                drop(state);
                debug!("Released session {} to pool", id);
                self.notify.notify_waiters();
            }
            None => {
                drop(state);
                debug!("Session {} no longer tracked, closing it", id);
                close_session(session).await;
            }
        }
    }

    /// Drops a session that misbehaved, freeing its slot.
    pub async fn mark_bad(&self, handle: PooledSession) {
        let PooledSession { id, session, lease, .. } = handle;
        lease.disarm();
        self.state.lock().await.remove(id);
        warn!("{} Session {} marked bad, closing it", self.log_prefix(), id);
        self.discard(vec![session]);
        self.notify.notify_waiters();
    }

    /// Evicts the entry of a handle that was dropped instead of handed back.
    async fn forget(&self, id: Uuid) {
        self.state.lock().await.remove(id);
        self.notify.notify_waiters();
    }

    /// Closes every idle session and fails all current and future acquires.
    /// Borrowed sessions are closed when they come back.
    pub async fn close(&self) {
        let sessions: Vec<Box<dyn MailSession>> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.drain(..).filter_map(|e| e.session).collect()
        };
        self.notify.notify_waiters();
        info!("{} Closing connection pool ({} idle sessions)", self.log_prefix(), sessions.len());
        futures::future::join_all(sessions.into_iter().map(close_session)).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let in_use = state.entries.iter().filter(|e| e.in_use()).count();
        PoolStats {
            total: state.entries.len(),
            in_use,
            idle: state.entries.len() - in_use,
            creating: self.creating.load(Ordering::SeqCst),
            max_size: self.config.max_size,
            created: state.created,
            reused: state.reused,
            health_failures: state.health_failures,
        }
    }

    /// Closes sessions in the background so callers never wait on LOGOUT.
    fn discard(&self, sessions: Vec<Box<dyn MailSession>>) {
        for session in sessions {
            tokio::spawn(close_session(session));
        }
    }
}
