// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end cleaning runs against the scripted server.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mailsweep::cleaner::{
    CleanError, CleanProgress, CleanRequest, CleanStatus, Cleaner, CleanerConfig, FolderStatus,
};
use mailsweep::config::PoolSettings;
use mailsweep::connection_pool::{ConnectionPool, PoolConfig, PoolError};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::common::{test_config, MockFactory, MockServer};

fn fast_retries() -> CleanerConfig {
    CleanerConfig {
        retry_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn setup(server: &Arc<MockServer>) -> (Arc<ConnectionPool>, Arc<MockFactory>) {
    let factory = MockFactory::new(Arc::clone(server));
    let pool = ConnectionPool::new(test_config(), factory.clone(), PoolConfig::default());
    (pool, factory)
}

fn request(folders: &[&str]) -> CleanRequest {
    CleanRequest {
        account_id: 1,
        folders: folders.iter().map(|f| f.to_string()).collect(),
        end_date: "2030-12-31".to_string(),
        ..Default::default()
    }
}

async fn drain(mut rx: mpsc::Receiver<CleanProgress>) -> Vec<CleanProgress> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// =============================================================================
// Per-folder outcomes
// =============================================================================

#[tokio::test]
async fn test_empty_folder_completes_without_search() {
    let server = MockServer::new();
    server.add_folder("Empty", 0, "a@example.com");
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());

    let result = cleaner.clean(request(&["Empty"])).await.unwrap();

    assert_eq!(result.status, CleanStatus::Completed);
    assert_eq!(result.total_deleted, 0);
    let stat = &result.folder_stats[0];
    assert_eq!(stat.status, FolderStatus::Completed);
    assert_eq!(stat.matched_count, 0);
    assert!(server.searches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_preview_counts_without_mutating() {
    let server = MockServer::new();
    server.add_folder("INBOX", 50, "news@example.com");
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());
    let rx = cleaner.take_progress().unwrap();

    let mut req = request(&["INBOX"]);
    req.preview_only = true;
    let result = cleaner.clean(req).await.unwrap();
    let events = drain(rx).await;

    assert_eq!(result.folder_stats[0].matched_count, 50);
    assert_eq!(result.total_deleted, 0);
    assert_eq!(server.store_calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.expunge_calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.message_count("INBOX"), 50);
    assert!(events.iter().any(|e| e.matched_count == 50 && e.message.contains("Preview")));
}

#[tokio::test]
async fn test_deletes_in_batches_with_progress_per_batch() {
    let server = MockServer::new();
    server.add_folder("INBOX", 250, "bulk@example.com");
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());
    let rx = cleaner.take_progress().unwrap();

    let mut req = request(&["INBOX"]);
    req.batch_size = 100;
    let result = cleaner.clean(req).await.unwrap();
    let events = drain(rx).await;

    assert_eq!(result.status, CleanStatus::Completed);
    assert_eq!(result.total_deleted, 250);
    assert_eq!(result.folder_stats[0].deleted_count, 250);
    assert_eq!(server.store_calls.load(Ordering::SeqCst), 3);
    assert_eq!(server.expunge_calls.load(Ordering::SeqCst), 3);
    assert_eq!(server.message_count("INBOX"), 0);

    let batches: Vec<(usize, usize, usize)> = events
        .iter()
        .filter(|e| e.total_batches > 0)
        .map(|e| (e.current_batch, e.total_batches, e.deleted_count))
        .collect();
    assert_eq!(batches, vec![(1, 3, 100), (2, 3, 200), (3, 3, 250)]);

    let last = events.last().unwrap();
    assert_eq!(last.status, CleanStatus::Completed);
    assert_eq!(last.deleted_count, 250);
}

#[tokio::test]
async fn test_folder_failure_does_not_abort_others() {
    let server = MockServer::new();
    server.add_folder("INBOX", 10, "a@example.com");
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());

    let result = cleaner.clean(request(&["Missing", "INBOX"])).await.unwrap();

    assert_eq!(result.status, CleanStatus::Completed);
    assert_eq!(result.folder_stats[0].folder, "Missing");
    assert_eq!(result.folder_stats[0].status, FolderStatus::Failed);
    assert!(result.folder_stats[0].error.is_some());
    assert_eq!(result.folder_stats[1].status, FolderStatus::Completed);
    assert_eq!(result.total_deleted, 10);
}

#[tokio::test]
async fn test_bounded_concurrency_limits_sessions() {
    let server = MockServer::new();
    for name in ["A", "B", "C", "D"] {
        server.add_folder(name, 5, "a@example.com");
    }
    let (pool, factory) = setup(&server);
    let cleaner = Cleaner::with_config(Arc::clone(&pool), fast_retries());

    let mut req = request(&["A", "B", "C", "D"]);
    req.max_concurrency = 2;
    let result = cleaner.clean(req).await.unwrap();

    assert_eq!(result.total_deleted, 20);
    assert!(factory.created() <= 2);
    assert_eq!(pool.stats().await.in_use, 0);
}

// =============================================================================
// Retry with reconnect
// =============================================================================

#[tokio::test]
async fn test_failed_batch_is_retried_on_new_session() {
    let server = MockServer::new();
    server.add_folder("INBOX", 20, "a@example.com");
    server.fail_stores.store(1, Ordering::SeqCst);
    let (pool, factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());

    let result = cleaner.clean(request(&["INBOX"])).await.unwrap();

    assert_eq!(result.folder_stats[0].status, FolderStatus::Completed);
    assert_eq!(result.total_deleted, 20);
    assert_eq!(factory.created(), 2);
    assert_eq!(server.store_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_folder() {
    let server = MockServer::new();
    server.add_folder("INBOX", 20, "a@example.com");
    server.fail_stores.store(10, Ordering::SeqCst);
    let (pool, factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());

    let result = cleaner.clean(request(&["INBOX"])).await.unwrap();

    let stat = &result.folder_stats[0];
    assert_eq!(stat.status, FolderStatus::Failed);
    assert!(stat.error.as_deref().unwrap().contains("after 3 attempts"));
    assert_eq!(stat.deleted_count, 0);
    assert_eq!(server.store_calls.load(Ordering::SeqCst), 3);
    assert_eq!(factory.created(), 3);
    assert_eq!(server.message_count("INBOX"), 20);
}

// =============================================================================
// Client-side filtering
// =============================================================================

fn mixed_senders() -> Arc<MockServer> {
    let server = MockServer::new();
    server.add_message("INBOX", 1, "promo@shop.com", "Sale");
    server.add_message("INBOX", 2, "friend@example.com", "Lunch?");
    server.add_message("INBOX", 3, "PROMO@shop.com", "Last chance");
    server.no_text_search.store(true, Ordering::SeqCst);
    server
}

#[tokio::test]
async fn test_client_fallback_filters_envelopes() {
    let server = mixed_senders();
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());
    let rx = cleaner.take_progress().unwrap();

    let mut req = request(&["INBOX"]);
    req.filter_sender = "promo@".to_string();
    req.enable_client_fallback = true;
    let result = cleaner.clean(req).await.unwrap();
    let events = drain(rx).await;

    assert_eq!(result.folder_stats[0].matched_count, 2);
    assert_eq!(result.total_deleted, 2);
    assert_eq!(server.remaining_uids("INBOX"), vec![2]);
    assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.searches.lock().unwrap().len(), 2);
    assert!(events.iter().any(|e| e.message.contains("locally")));
}

#[tokio::test]
async fn test_without_fallback_unsupported_search_matches_nothing() {
    let server = mixed_senders();
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());

    let mut req = request(&["INBOX"]);
    req.filter_sender = "promo@".to_string();
    let result = cleaner.clean(req).await.unwrap();

    assert_eq!(result.folder_stats[0].status, FolderStatus::Completed);
    assert_eq!(result.folder_stats[0].matched_count, 0);
    assert_eq!(server.message_count("INBOX"), 3);
    assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Run lifecycle
// =============================================================================

#[tokio::test]
async fn test_cancel_stops_new_batches_and_folders() {
    let server = MockServer::new();
    server.add_folder("First", 300, "a@example.com");
    server.add_folder("Second", 10, "a@example.com");
    server.set_store_delay(Duration::from_millis(100));
    let (pool, _factory) = setup(&server);
    let cleaner = Arc::new(Cleaner::with_config(pool, fast_retries()));
    let mut rx = cleaner.take_progress().unwrap();

    let mut req = request(&["First", "Second"]);
    req.batch_size = 100;
    req.max_concurrency = 1;
    let run = {
        let cleaner = Arc::clone(&cleaner);
        tokio::spawn(async move { cleaner.clean(req).await })
    };

    while let Some(event) = rx.recv().await {
        if event.current_batch == 1 {
            break;
        }
    }
    cleaner.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, CleanStatus::Cancelled);
    assert_eq!(result.folder_stats.len(), 1);
    assert_eq!(result.folder_stats[0].status, FolderStatus::Cancelled);
    assert!(result.total_deleted >= 100 && result.total_deleted < 300);
    assert_eq!(server.message_count("First"), 300 - result.total_deleted);
    assert_eq!(server.message_count("Second"), 10);
}

#[tokio::test]
async fn test_only_one_run_at_a_time() {
    let server = MockServer::new();
    server.add_folder("INBOX", 10, "a@example.com");
    server.set_store_delay(Duration::from_millis(200));
    let (pool, _factory) = setup(&server);
    let cleaner = Arc::new(Cleaner::with_config(pool, fast_retries()));

    let run = {
        let cleaner = Arc::clone(&cleaner);
        tokio::spawn(async move { cleaner.clean(request(&["INBOX"])).await })
    };
    sleep(Duration::from_millis(30)).await;

    assert!(cleaner.is_running());
    let second = cleaner.clean(request(&["INBOX"])).await;
    assert!(matches!(second, Err(CleanError::AlreadyRunning)));

    run.await.unwrap().unwrap();
    assert!(!cleaner.is_running());
    assert!(cleaner.take_progress().is_some());
}

#[tokio::test]
async fn test_invalid_date_fails_and_closes_progress() {
    let server = MockServer::new();
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_config(pool, fast_retries());
    let rx = cleaner.take_progress().unwrap();

    let mut req = request(&["INBOX"]);
    req.end_date = "31/12/2024".to_string();
    let err = cleaner.clean(req).await.unwrap_err();
    let events = drain(rx).await;

    assert!(matches!(err, CleanError::InvalidDate { .. }));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, CleanStatus::Failed);
    assert!(!cleaner.is_running());
}

#[tokio::test]
async fn test_owned_pool_is_closed_after_run() {
    let server = MockServer::new();
    server.add_folder("INBOX", 3, "a@example.com");
    let (pool, _factory) = setup(&server);
    let cleaner = Cleaner::with_owned_pool(Arc::clone(&pool));

    let result = cleaner.clean(request(&["INBOX"])).await.unwrap();

    assert_eq!(result.total_deleted, 3);
    assert!(pool.is_closed().await);
    assert_eq!(server.logouts.load(Ordering::SeqCst), 1);

    // The pool went with the first run; a second one is refused outright.
    server.add_folder("Archive", 3, "a@example.com");
    let second = cleaner.clean(request(&["Archive"])).await;
    assert!(matches!(second, Err(CleanError::Pool(PoolError::Closed))));
    assert!(!cleaner.is_running());
    assert_eq!(server.message_count("Archive"), 3);
}

#[tokio::test]
async fn test_pool_sized_to_concurrency_serves_every_worker() {
    let server = MockServer::new();
    server.add_folder("A", 20, "a@example.com");
    server.add_folder("B", 20, "b@example.com");
    server.set_store_delay(Duration::from_millis(150));
    let factory = MockFactory::new(Arc::clone(&server));

    let mut req = request(&["A", "B"]);
    req.max_concurrency = 2;
    let settings = PoolSettings {
        max_size: 1,
        idle_timeout_secs: 300,
    };
    let options = PoolConfig {
        acquire_timeout: Duration::from_millis(50),
        ..settings.pool_config_for(req.effective_concurrency())
    };
    let pool = ConnectionPool::new(test_config(), factory.clone(), options);
    let cleaner = Cleaner::with_config(Arc::clone(&pool), fast_retries());

    let result = cleaner.clean(req).await.unwrap();

    assert_eq!(result.status, CleanStatus::Completed);
    assert!(result
        .folder_stats
        .iter()
        .all(|s| s.status == FolderStatus::Completed));
    assert_eq!(result.total_deleted, 40);
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.stats().await.max_size, 2);
}
