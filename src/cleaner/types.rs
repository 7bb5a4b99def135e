// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::AccountId;
use crate::connection_pool::PoolError;
use crate::imap::search::{parse_senders, parse_size, FilterSpec, ReadState};
use crate::imap::ImapError;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

#[derive(Error, Debug)]
pub enum CleanError {
    #[error("A clean run is already in progress")]
    AlreadyRunning,

    #[error("Invalid {field} '{value}', expected YYYY-MM-DD")]
    InvalidDate { field: &'static str, value: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("IMAP error: {0}")]
    Imap(#[from] ImapError),

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ImapError,
    },
}

/// One bulk-deletion job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanRequest {
    pub account_id: AccountId,
    pub folders: Vec<String>,
    /// `YYYY-MM-DD`, empty for no lower bound
    pub start_date: String,
    /// `YYYY-MM-DD`, inclusive
    pub end_date: String,
    pub preview_only: bool,
    /// Messages per delete batch; zero or less means the default
    pub batch_size: i64,
    /// Folders cleaned in parallel; zero or less means the default
    pub max_concurrency: i64,
    /// Comma-separated sender substrings, OR-matched
    pub filter_sender: String,
    pub filter_subject: String,
    /// `>1M`, `<100K`, ...
    pub filter_size: String,
    /// `seen`, `unseen`, anything else for both
    pub filter_read: String,
    /// Filter sender/subject locally when the server search returns nothing
    pub enable_client_fallback: bool,
}

impl CleanRequest {
    pub fn effective_batch_size(&self) -> usize {
        usize::try_from(self.batch_size)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn effective_concurrency(&self) -> usize {
        usize::try_from(self.max_concurrency)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    /// Parses dates and filter strings into a [`FilterSpec`].
    pub fn filter_spec(&self) -> Result<FilterSpec, CleanError> {
        let start_date = match self.start_date.trim() {
            "" => None,
            s => Some(parse_date("start date", s)?),
        };
        let end_date = parse_date("end date", self.end_date.trim())?;
        let subject = self.filter_subject.trim();

        Ok(FilterSpec {
            start_date,
            end_date,
            size: parse_size(&self.filter_size),
            read: ReadState::parse(&self.filter_read),
            senders: parse_senders(&self.filter_sender),
            subject: (!subject.is_empty()).then(|| subject.to_string()),
        })
    }
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, CleanError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| CleanError::InvalidDate {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCleanStat {
    pub folder: String,
    pub matched_count: usize,
    pub deleted_count: usize,
    pub status: FolderStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FolderCleanStat {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            matched_count: 0,
            deleted_count: 0,
            status: FolderStatus::Completed,
            message: String::new(),
            error: None,
        }
    }
}

/// Best-effort progress event; consumers must tolerate gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanProgress {
    pub account_id: AccountId,
    pub current_folder: String,
    /// 1-based
    pub folder_index: usize,
    pub total_folders: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub deleted_count: usize,
    pub matched_count: usize,
    pub status: CleanStatus,
    pub message: String,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanResult {
    pub account_id: AccountId,
    pub total_deleted: usize,
    pub folder_stats: Vec<FolderCleanStat>,
    /// Seconds
    pub duration: f64,
    pub status: CleanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cleaner tunables.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Progress events buffered before new ones are dropped
    pub progress_buffer: usize,
    /// Attempts per operation, the first one included
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// UIDs per envelope fetch during client-side filtering
    pub fetch_batch_size: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            progress_buffer: 100,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            fetch_batch_size: 100,
        }
    }
}
