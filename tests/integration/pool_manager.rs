// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use mailsweep::connection_pool::PoolConfig;
use mailsweep::imap::ConnectionConfig;
use mailsweep::pool_manager::{ManagerConfig, PoolManager};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::common::{test_config, MockFactory, MockServer};

fn manager_with(config: ManagerConfig) -> (Arc<PoolManager>, Arc<MockFactory>) {
    let factory = MockFactory::new(MockServer::new());
    let manager = PoolManager::new(factory.clone(), config);
    (manager, factory)
}

fn oauth_config(token: &str) -> ConnectionConfig {
    ConnectionConfig::oauth2("imap.gmail.com", "user@gmail.com", token)
}

#[tokio::test]
async fn test_same_account_reuses_pool_and_updates_token() {
    let (manager, _factory) = manager_with(ManagerConfig::default());

    let first = manager.get_pool(1, oauth_config("old-token"), None).await;
    let second = manager.get_pool(1, oauth_config("new-token"), None).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        second.connection_config().access_token.as_deref(),
        Some("new-token")
    );
    assert_eq!(manager.pool_count().await, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_changed_username_replaces_pool() {
    let (manager, factory) = manager_with(ManagerConfig::default());

    let first = manager.get_pool(1, test_config(), None).await;
    let cancel = CancellationToken::new();
    let session = first.acquire(&cancel).await.unwrap();
    first.release(session).await;

    let changed = ConnectionConfig::password("imap.example.com", "other@example.com", "secret");
    let second = manager.get_pool(1, changed, None).await;

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_closed().await);
    assert!(!second.is_closed().await);

    let session = second.acquire(&cancel).await.unwrap();
    second.release(session).await;
    assert_eq!(
        factory.usernames.lock().unwrap().as_slice(),
        ["user@example.com", "other@example.com"]
    );
    manager.close().await;
}

#[tokio::test]
async fn test_explicit_pool_options_apply_to_new_pool() {
    let (manager, _factory) = manager_with(ManagerConfig::default());
    let options = PoolConfig {
        max_size: 7,
        ..Default::default()
    };

    let pool = manager.get_pool(5, test_config(), Some(options)).await;
    assert_eq!(pool.pool_config().max_size, 7);

    let default_pool = manager.get_pool(6, test_config(), None).await;
    assert_eq!(default_pool.pool_config().max_size, 3);

    let stats = manager.stats().await;
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[&5].max_size, 7);
    manager.close().await;
}

#[tokio::test]
async fn test_cleanup_evicts_only_idle_pools_without_borrowers() {
    let (manager, _factory) = manager_with(ManagerConfig {
        cleanup_interval: Duration::from_secs(3600),
        max_idle: Duration::from_millis(30),
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let idle = manager.get_pool(1, test_config(), None).await;
    let busy = manager.get_pool(2, test_config(), None).await;
    let borrowed = busy.acquire(&cancel).await.unwrap();

    sleep(Duration::from_millis(60)).await;
    let evicted = manager.cleanup_idle_pools().await;

    assert_eq!(evicted, vec![1]);
    assert!(idle.is_closed().await);
    assert!(!busy.is_closed().await);
    assert_eq!(manager.pool_count().await, 1);

    busy.release(borrowed).await;
    manager.close().await;
}

#[tokio::test]
async fn test_background_loop_evicts_idle_pools() {
    let (manager, _factory) = manager_with(ManagerConfig {
        cleanup_interval: Duration::from_millis(20),
        max_idle: Duration::from_millis(10),
        ..Default::default()
    });

    let pool = manager.get_pool(1, test_config(), None).await;
    sleep(Duration::from_millis(150)).await;

    assert!(pool.is_closed().await);
    assert_eq!(manager.pool_count().await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_close_pool_and_close_all() {
    let (manager, _factory) = manager_with(ManagerConfig::default());

    let one = manager.get_pool(1, test_config(), None).await;
    let two = manager.get_pool(2, test_config(), None).await;

    manager.close_pool(1).await;
    assert!(one.is_closed().await);
    assert_eq!(manager.pool_count().await, 1);

    manager.close().await;
    assert!(two.is_closed().await);
    assert_eq!(manager.pool_count().await, 0);
}
