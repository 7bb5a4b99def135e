// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bulk IMAP deletion from the command line.
//!
//! Usage:
//!   mailsweep --account 1 --folder INBOX --end-date 2023-12-31 --preview
//!   mailsweep --account 1 --folder INBOX --folder Spam --sender ads@,promo@ --end-date 2024-06-30
//!
//! Exit codes:
//!   0 - Run finished (check the printed result for per-folder failures)
//!   1 - Setup error

use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info, warn};

use mailsweep::account::{MemoryTokenStore, TokenManager, TokenStore};
use mailsweep::cleaner::{CleanRequest, CleanStatus, Cleaner};
use mailsweep::config::Settings;
use mailsweep::imap::oauth2::OAuth2RefreshClient;
use mailsweep::imap::ImapConnectionFactory;
use mailsweep::net::{Dialer, ProxyDialer};
use mailsweep::pool_manager::{ManagerConfig, PoolManager};

#[derive(Parser, Debug)]
#[command(name = "mailsweep", version, about = "Delete IMAP mail matching a filter, folder by folder")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "MAILSWEEP_CONFIG")]
    config: Option<String>,

    /// Account id from the configuration.
    #[arg(long)]
    account: i64,

    /// Folder to clean; repeat for several.
    #[arg(long = "folder", required = true)]
    folders: Vec<String>,

    /// Only messages on or after this date (YYYY-MM-DD).
    #[arg(long)]
    start_date: Option<String>,

    /// Only messages on or before this date (YYYY-MM-DD).
    #[arg(long)]
    end_date: String,

    /// Comma-separated sender substrings.
    #[arg(long)]
    sender: Option<String>,

    #[arg(long)]
    subject: Option<String>,

    /// Size filter such as `>1M` or `<100K`.
    #[arg(long)]
    size: Option<String>,

    /// `seen` or `unseen`.
    #[arg(long)]
    read: Option<String>,

    /// Count matches without deleting anything.
    #[arg(long)]
    preview: bool,

    #[arg(long)]
    batch_size: Option<i64>,

    #[arg(long)]
    concurrency: Option<i64>,

    /// Filter sender/subject locally when the server search finds nothing.
    #[arg(long)]
    client_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {}", err);
        exit(1);
    });
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str()));

    let Some(account) = settings.account(cli.account).cloned() else {
        error!("Account {} is not configured", cli.account);
        exit(1);
    };

    let dialer: Arc<dyn Dialer> = Arc::new(ProxyDialer::new(settings.proxy.clone()));
    let factory = match ImapConnectionFactory::new(dialer) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!("Failed to set up TLS: {}", e);
            exit(1);
        }
    };

    let mut connection = account.connection_config();
    if connection.auth_type.is_oauth2() {
        let Some(token) = account.stored_token() else {
            error!("Account {} uses OAuth2 but has no oauth_provider configured", account.id);
            exit(1);
        };
        let store = Arc::new(MemoryTokenStore::new());
        store.save(account.id, token).await?;
        let client = Arc::new(OAuth2RefreshClient::new(&settings.proxy)?);
        let tokens = Arc::new(TokenManager::new(store, client));

        match tokens.access_token(account.id).await {
            Ok(access_token) => connection.access_token = Some(access_token),
            Err(e) => {
                error!("Cannot obtain an access token for account {}: {}", account.id, e);
                exit(1);
            }
        }
        connection = connection.with_refresher(tokens.refresher(account.id));
    }

    let manager = PoolManager::new(
        factory,
        ManagerConfig {
            default_pool: settings.pool.pool_config(),
            ..ManagerConfig::default()
        },
    );

    let request = CleanRequest {
        account_id: account.id,
        folders: cli.folders,
        start_date: cli.start_date.unwrap_or_default(),
        end_date: cli.end_date,
        preview_only: cli.preview,
        batch_size: cli.batch_size.unwrap_or(settings.cleaner.batch_size),
        max_concurrency: cli.concurrency.unwrap_or(settings.cleaner.max_concurrency),
        filter_sender: cli.sender.unwrap_or_default(),
        filter_subject: cli.subject.unwrap_or_default(),
        filter_size: cli.size.unwrap_or_default(),
        filter_read: cli.read.unwrap_or_default(),
        enable_client_fallback: cli.client_fallback,
    };

    let pool_options = settings.pool.pool_config_for(request.effective_concurrency());
    let pool = manager.get_pool(account.id, connection, Some(pool_options)).await;
    let cleaner = Arc::new(Cleaner::new(pool));

    let progress_task = cleaner.take_progress().map(|mut rx| {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.current_folder.is_empty() {
                    info!("{}", event.message);
                } else {
                    info!(
                        "[{}/{}] {} ({} matched, {} deleted, {:.1}s)",
                        event.folder_index,
                        event.total_folders,
                        event.message,
                        event.matched_count,
                        event.deleted_count,
                        event.elapsed_seconds
                    );
                }
            }
            debug!("Progress stream closed");
        })
    });

    let interrupt = {
        let cleaner = Arc::clone(&cleaner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight batches");
                cleaner.cancel();
            }
        })
    };

    let outcome = cleaner.clean(request).await;
    interrupt.abort();
    if let Some(task) = progress_task {
        let _ = task.await;
    }
    manager.close().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.status == CleanStatus::Cancelled {
                warn!("Run cancelled; {} messages were deleted", result.total_deleted);
            }
            Ok(())
        }
        Err(e) => {
            error!("Clean run failed: {}", e);
            exit(1);
        }
    }
}
