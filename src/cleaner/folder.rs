// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-folder cleaning procedure.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::account::AccountId;
use crate::cleaner::types::{
    CleanError, CleanProgress, CleanStatus, CleanerConfig, FolderCleanStat, FolderStatus,
};
use crate::connection_pool::{ConnectionPool, PoolError, PooledSession};
use crate::imap::search::FilterSpec;
use crate::imap::{ImapError, MailSession};

/// State shared by all folder workers of one run.
pub(crate) struct RunContext {
    pub pool: Arc<ConnectionPool>,
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::Sender<CleanProgress>>,
    pub config: CleanerConfig,
    pub filter: FilterSpec,
    pub account_id: AccountId,
    pub total_folders: usize,
    pub batch_size: usize,
    pub preview_only: bool,
    pub client_fallback: bool,
    pub started: Instant,
}

impl RunContext {
    /// Non-blocking send; events are dropped when the buffer is full.
    pub fn emit(&self, progress: CleanProgress) {
        let Some(tx) = &self.progress else { return };
        match tx.try_send(progress) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                debug!("Progress buffer full, dropping event: {}", dropped.message)
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    async fn backoff(&self) -> Result<(), CleanError> {
        tokio::select! {
            _ = sleep(self.config.retry_backoff) => Ok(()),
            _ = self.cancel.cancelled() => Err(CleanError::Cancelled),
        }
    }
}

/// Cleans one folder on a session borrowed from the pool.
pub(crate) struct FolderWorker {
    ctx: Arc<RunContext>,
    folder: String,
    /// 0-based position in the request
    index: usize,
    session: Option<PooledSession>,
}

impl FolderWorker {
    pub fn new(ctx: Arc<RunContext>, index: usize, folder: String) -> Self {
        Self {
            ctx,
            folder,
            index,
            session: None,
        }
    }

    /// Runs the folder to a terminal state. The session always goes back to the pool.
    pub async fn run(mut self) -> FolderCleanStat {
        let mut stat = FolderCleanStat::new(self.folder.clone());
        let outcome = self.clean(&mut stat).await;

        if let Some(session) = self.session.take() {
            self.ctx.pool.release(session).await;
        }

        match outcome {
            Ok(()) => {
                stat.status = FolderStatus::Completed;
                if stat.message.is_empty() {
                    stat.message = format!("Folder {}: done", self.folder);
                }
            }
            Err(CleanError::Cancelled) => {
                stat.status = FolderStatus::Cancelled;
                stat.message = format!(
                    "Folder {}: cancelled after deleting {} messages",
                    self.folder, stat.deleted_count
                );
            }
            Err(e) => {
                warn!("Folder {} failed: {}", self.folder, e);
                stat.status = FolderStatus::Failed;
                stat.message = format!("Folder {}: failed", self.folder);
                stat.error = Some(e.to_string());
            }
        }
        stat
    }

    fn progress(&self, message: String) -> CleanProgress {
        CleanProgress {
            account_id: self.ctx.account_id,
            current_folder: self.folder.clone(),
            folder_index: self.index + 1,
            total_folders: self.ctx.total_folders,
            status: CleanStatus::Running,
            message,
            elapsed_seconds: self.ctx.elapsed_seconds(),
            ..Default::default()
        }
    }

    fn finish(&self, stat: &mut FolderCleanStat, message: String) {
        let mut event = self.progress(message.clone());
        event.matched_count = stat.matched_count;
        event.deleted_count = stat.deleted_count;
        self.ctx.emit(event);
        stat.message = message;
    }

    async fn clean(&mut self, stat: &mut FolderCleanStat) -> Result<(), CleanError> {
        self.session = Some(self.acquire().await?);

        let folder = self.folder.clone();
        let mailbox = match self.session_mut()?.select_folder(&folder).await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                self.discard_if_broken(&e).await;
                return Err(e.into());
            }
        };
        if mailbox.exists == 0 {
            self.finish(stat, format!("Folder {} is empty", self.folder));
            return Ok(());
        }

        let (mut uids, client_filter) = self.search().await?;
        if uids.is_empty() {
            self.finish(stat, format!("Folder {}: no matching messages", self.folder));
            return Ok(());
        }

        if client_filter {
            let total = uids.len();
            uids = self.filter_by_envelope(uids).await?;
            debug!("Folder {}: client-side filter kept {} of {}", self.folder, uids.len(), total);
        }

        stat.matched_count = uids.len();
        if uids.is_empty() {
            self.finish(stat, format!("Folder {}: no matching messages", self.folder));
            return Ok(());
        }

        if self.ctx.preview_only {
            self.finish(
                stat,
                format!("Preview: folder {} has {} matching messages", self.folder, stat.matched_count),
            );
            return Ok(());
        }

        self.delete_batches(&uids, stat).await?;
        stat.message = format!("Folder {}: deleted {} messages", self.folder, stat.deleted_count);
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut PooledSession, CleanError> {
        self.session
            .as_mut()
            .ok_or_else(|| CleanError::Imap(ImapError::Connection("no session held".to_string())))
    }

    /// Borrows a session, retrying transient pool failures with backoff.
    /// The returned future owns what it needs so no borrow of the worker spans the wait.
    fn acquire(&self) -> impl Future<Output = Result<PooledSession, CleanError>> + Send + 'static {
        let ctx = Arc::clone(&self.ctx);
        let folder = self.folder.clone();
        async move {
            let attempts = ctx.config.retry_attempts.max(1);
            let mut last_err = PoolError::Closed;

            for attempt in 1..=attempts {
                if ctx.cancel.is_cancelled() {
                    return Err(CleanError::Cancelled);
                }
                match ctx.pool.acquire(&ctx.cancel).await {
                    Ok(session) => return Ok(session),
                    Err(PoolError::Cancelled) => return Err(CleanError::Cancelled),
                    Err(PoolError::Closed) => return Err(PoolError::Closed.into()),
                    Err(e) => {
                        warn!(
                            "Folder {}: getting a session failed ({}/{}): {}",
                            folder, attempt, attempts, e
                        );
                        last_err = e;
                    }
                }
                if attempt < attempts {
                    ctx.backoff().await?;
                }
            }
            Err(last_err.into())
        }
    }

    async fn discard_if_broken(&mut self, err: &ImapError) {
        if err.is_connect_error() {
            if let Some(session) = self.session.take() {
                self.ctx.pool.mark_bad(session).await;
            }
        }
    }

    /// Swaps the current session for a fresh one with the folder re-selected.
    async fn reconnect(&mut self) -> Result<(), CleanError> {
        if let Some(session) = self.session.take() {
            self.ctx.pool.mark_bad(session).await;
        }
        let mut session = self.acquire().await?;
        let selected = session.select_folder(&self.folder).await;
        self.session = Some(session);
        selected.map(|_| ()).map_err(CleanError::from)
    }

    /// Runs `op` on the current session. On failure, waits, replaces the
    /// session and retries, up to the configured number of attempts.
    async fn with_reconnect<T, F>(&mut self, mut op: F) -> Result<T, CleanError>
    where
        F: for<'s> FnMut(&'s mut dyn MailSession) -> BoxFuture<'s, Result<T, ImapError>>,
    {
        let attempts = self.ctx.config.retry_attempts.max(1);
        let mut last_err = ImapError::Unknown("operation never ran".to_string());

        for attempt in 1..=attempts {
            if self.ctx.cancel.is_cancelled() {
                return Err(CleanError::Cancelled);
            }

            if attempt > 1 {
                self.ctx.backoff().await?;
                match self.reconnect().await {
                    Ok(()) => {}
                    Err(CleanError::Imap(e)) => {
                        warn!("Folder {}: re-select failed ({}/{}): {}", self.folder, attempt, attempts, e);
                        last_err = e;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let session = self.session_mut()?;
            match op(&mut **session).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Folder {}: operation failed ({}/{}): {}", self.folder, attempt, attempts, e);
                    last_err = e;
                }
            }
        }

        Err(CleanError::RetriesExhausted {
            attempts,
            source: last_err,
        })
    }

    /// Server-side search; returns the UIDs and whether they still need local filtering.
    async fn search(&mut self) -> Result<(Vec<u32>, bool), CleanError> {
        let full_query = self.ctx.filter.full_criteria().to_query();
        let base_query = self.ctx.filter.base_criteria().to_query();
        let fallback = self.ctx.client_fallback && self.ctx.filter.has_text_filters();
        debug!("Folder {}: UID SEARCH {}", self.folder, full_query);

        let (uids, client_filter) = self
            .with_reconnect(|session| {
                let full_query = full_query.clone();
                let base_query = base_query.clone();
                Box::pin(async move {
                    let uids = session.uid_search(&full_query).await?;
                    if !uids.is_empty() || !fallback {
                        return Ok((uids, false));
                    }
                    let base = session.uid_search(&base_query).await?;
                    let needs_filter = !base.is_empty();
                    Ok::<_, ImapError>((if needs_filter { base } else { uids }, needs_filter))
                })
            })
            .await?;

        if client_filter {
            info!(
                "Folder {}: server search matched nothing, filtering {} messages locally",
                self.folder,
                uids.len()
            );
            self.ctx.emit(self.progress(format!(
                "Folder {}: server cannot search {}, filtering {} messages locally",
                self.folder,
                self.filter_description(),
                uids.len()
            )));
        }
        Ok((uids, client_filter))
    }

    fn filter_description(&self) -> &'static str {
        match (self.ctx.filter.senders.is_empty(), self.ctx.filter.subject.is_some()) {
            (false, true) => "sender/subject",
            (false, false) => "sender",
            _ => "subject",
        }
    }

    async fn filter_by_envelope(&mut self, uids: Vec<u32>) -> Result<Vec<u32>, CleanError> {
        let chunk_size = self.ctx.config.fetch_batch_size.max(1);
        let total_batches = uids.len().div_ceil(chunk_size);
        let mut kept = Vec::new();

        for (batch_idx, chunk) in uids.chunks(chunk_size).enumerate() {
            if self.ctx.cancel.is_cancelled() {
                return Err(CleanError::Cancelled);
            }

            let batch_num = batch_idx + 1;
            if batch_num % 10 == 0 || batch_num == total_batches {
                let scanned = (batch_idx * chunk_size + chunk.len()).min(uids.len());
                self.ctx.emit(self.progress(format!(
                    "Folder {}: filtering {} {}/{} ({} matched)",
                    self.folder,
                    self.filter_description(),
                    scanned,
                    uids.len(),
                    kept.len()
                )));
            }

            let batch = chunk.to_vec();
            let envelopes = self
                .with_reconnect(|session| {
                    let batch = batch.clone();
                    Box::pin(async move { session.fetch_envelopes(&batch).await })
                })
                .await?;

            kept.extend(
                envelopes
                    .iter()
                    .filter(|env| self.ctx.filter.matches_envelope(env))
                    .map(|env| env.uid),
            );
        }
        Ok(kept)
    }

    async fn delete_batches(&mut self, uids: &[u32], stat: &mut FolderCleanStat) -> Result<(), CleanError> {
        let batch_size = self.ctx.batch_size.max(1);
        let total_batches = uids.len().div_ceil(batch_size);

        for (batch_idx, chunk) in uids.chunks(batch_size).enumerate() {
            if self.ctx.cancel.is_cancelled() {
                return Err(CleanError::Cancelled);
            }

            let batch = chunk.to_vec();
            self.with_reconnect(|session| {
                let batch = batch.clone();
                Box::pin(async move {
                    session.mark_deleted(&batch).await?;
                    session.expunge().await
                })
            })
            .await?;

            stat.deleted_count += chunk.len();
            let mut event = self.progress(format!(
                "Folder {}: batch {}/{} done, {} deleted",
                self.folder,
                batch_idx + 1,
                total_batches,
                stat.deleted_count
            ));
            event.current_batch = batch_idx + 1;
            event.total_batches = total_batches;
            event.deleted_count = stat.deleted_count;
            event.matched_count = stat.matched_count;
            self.ctx.emit(event);
        }
        Ok(())
    }
}
