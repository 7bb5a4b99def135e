// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bulk deletion across folders.
//!
//! A [`Cleaner`] runs one [`CleanRequest`] at a time. Folders are cleaned in
//! parallel, bounded by the request's concurrency, each on a session borrowed
//! from the account's [`ConnectionPool`]. Progress is reported on a bounded
//! channel obtained with [`Cleaner::take_progress`]; events are dropped when
//! the consumer falls behind. The channel is closed after the final event of
//! each run and a fresh one is installed for the next.

mod folder;
pub mod types;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use log::{error, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::connection_pool::{ConnectionPool, PoolError};
use folder::{FolderWorker, RunContext};

pub use types::{
    CleanError, CleanProgress, CleanRequest, CleanResult, CleanStatus, CleanerConfig,
    FolderCleanStat, FolderStatus, DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY,
};

#[derive(Default)]
struct RunState {
    running: bool,
    cancel: Option<CancellationToken>,
}

struct ProgressChannel {
    tx: Option<mpsc::Sender<CleanProgress>>,
    rx: Option<mpsc::Receiver<CleanProgress>>,
}

impl ProgressChannel {
    fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

pub struct Cleaner {
    pool: Arc<ConnectionPool>,
    owns_pool: bool,
    config: CleanerConfig,
    state: StdMutex<RunState>,
    progress: StdMutex<ProgressChannel>,
}

/// Resets the run state when a run ends, however it ends.
struct RunGuard<'a> {
    cleaner: &'a Cleaner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.cleaner.state.lock() {
            state.running = false;
            state.cancel = None;
        }
        if let Ok(mut progress) = self.cleaner.progress.lock() {
            *progress = ProgressChannel::new(self.cleaner.config.progress_buffer);
        }
    }
}

impl Cleaner {
    /// Cleaner over a shared pool, left open after each run.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_config(pool, CleanerConfig::default())
    }

    pub fn with_config(pool: Arc<ConnectionPool>, config: CleanerConfig) -> Self {
        Self {
            pool,
            owns_pool: false,
            progress: StdMutex::new(ProgressChannel::new(config.progress_buffer)),
            config,
            state: StdMutex::new(RunState::default()),
        }
    }

    /// Cleaner that closes `pool` when a run finishes. It is single-use: later
    /// calls to [`Cleaner::clean`] fail with [`PoolError::Closed`].
    pub fn with_owned_pool(pool: Arc<ConnectionPool>) -> Self {
        Self {
            owns_pool: true,
            ..Self::new(pool)
        }
    }

    /// Receiver for the next (or current) run's progress events.
    /// Returns `None` if it was already taken.
    pub fn take_progress(&self) -> Option<mpsc::Receiver<CleanProgress>> {
        self.progress.lock().ok().and_then(|mut p| p.rx.take())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }

    /// Requests a cooperative stop of the active run. No-op when idle.
    pub fn cancel(&self) {
        if let Ok(state) = self.state.lock() {
            if let Some(token) = &state.cancel {
                info!("Cancelling clean run");
                token.cancel();
            }
        }
    }

    fn begin(&self) -> Result<(RunGuard<'_>, CancellationToken), CleanError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CleanError::AlreadyRunning)?;
        if state.running {
            return Err(CleanError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        state.running = true;
        state.cancel = Some(token.clone());
        Ok((RunGuard { cleaner: self }, token))
    }

    pub async fn clean(&self, request: CleanRequest) -> Result<CleanResult, CleanError> {
        let (_guard, cancel) = self.begin()?;
        if self.owns_pool && self.pool.is_closed().await {
            warn!("Cleaner's own pool was closed by an earlier run");
            return Err(PoolError::Closed.into());
        }
        let started = Instant::now();
        let progress_tx = self.progress.lock().ok().and_then(|mut p| p.tx.take());

        let outcome = self.run(request, cancel, progress_tx, started).await;

        if self.owns_pool {
            let stats = self.pool.stats().await;
            info!(
                "Closing connection pool: created={} reused={} health_failures={}",
                stats.created, stats.reused, stats.health_failures
            );
            self.pool.close().await;
        }
        outcome
    }

    async fn run(
        &self,
        request: CleanRequest,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<CleanProgress>>,
        started: Instant,
    ) -> Result<CleanResult, CleanError> {
        let account_id = request.account_id;
        let filter = match request.filter_spec() {
            Ok(filter) => filter,
            Err(e) => {
                error!("Rejecting clean request for account {}: {}", account_id, e);
                if let Some(tx) = &progress {
                    let _ = tx.try_send(CleanProgress {
                        account_id,
                        status: CleanStatus::Failed,
                        message: e.to_string(),
                        elapsed_seconds: started.elapsed().as_secs_f64(),
                        ..Default::default()
                    });
                }
                return Err(e);
            }
        };

        let concurrency = request.effective_concurrency();
        let folders = request.folders.clone();
        info!(
            "Cleaning {} folders for account {} (query: {}, concurrency {}, preview {})",
            folders.len(),
            account_id,
            filter.full_criteria(),
            concurrency,
            request.preview_only
        );

        let ctx = Arc::new(RunContext {
            pool: Arc::clone(&self.pool),
            cancel: cancel.clone(),
            progress,
            config: self.config.clone(),
            filter,
            account_id,
            total_folders: folders.len(),
            batch_size: request.effective_batch_size(),
            preview_only: request.preview_only,
            client_fallback: request.enable_client_fallback,
            started,
        });

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (result_tx, mut result_rx) = mpsc::channel(folders.len().max(1));
        let mut interrupted = false;
        let mut handles = Vec::with_capacity(folders.len());

        for (index, folder) in folders.into_iter().enumerate() {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        interrupted = true;
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
            };

            let worker = FolderWorker::new(Arc::clone(&ctx), index, folder);
            let tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                let stat = worker.run().await;
                drop(permit);
                let _ = tx.send((index, stat)).await;
            }));
        }
        drop(result_tx);

        if interrupted {
            warn!(
                "Clean run for account {} cancelled after dispatching {} folders",
                account_id,
                handles.len()
            );
        }

        let mut collected = Vec::with_capacity(handles.len());
        while let Some(entry) = result_rx.recv().await {
            collected.push(entry);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Folder worker task failed: {}", e);
            }
        }
        collected.sort_by_key(|(index, _)| *index);
        let folder_stats: Vec<FolderCleanStat> = collected.into_iter().map(|(_, s)| s).collect();

        let total_deleted = folder_stats.iter().map(|s| s.deleted_count).sum();
        let total_matched = folder_stats.iter().map(|s| s.matched_count).sum();
        let status = if interrupted || cancel.is_cancelled() {
            CleanStatus::Cancelled
        } else {
            CleanStatus::Completed
        };
        let duration = started.elapsed().as_secs_f64();

        let message = match (status, request.preview_only) {
            (CleanStatus::Cancelled, _) => {
                format!("Cancelled: {} messages deleted in {:.1}s", total_deleted, duration)
            }
            (_, true) => format!("Preview: {} matching messages", total_matched),
            _ => format!("Done: {} messages deleted in {:.1}s", total_deleted, duration),
        };
        info!("Account {}: {}", account_id, message);

        ctx.emit(CleanProgress {
            account_id,
            total_folders: ctx.total_folders,
            folder_index: folder_stats.len(),
            deleted_count: total_deleted,
            matched_count: total_matched,
            status,
            message,
            elapsed_seconds: duration,
            ..Default::default()
        });

        Ok(CleanResult {
            account_id,
            total_deleted,
            folder_stats,
            duration,
            status,
            error: None,
        })
    }
}
