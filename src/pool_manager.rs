// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::AccountId;
use crate::connection_pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::imap::client::ConnectionFactory;
use crate::imap::ConnectionConfig;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often idle pools are swept
    pub cleanup_interval: Duration,
    /// Pools unused for longer than this, with nothing borrowed, are closed
    pub max_idle: Duration,
    /// Used when `get_pool` is called without explicit options
    pub default_pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(600),
            max_idle: Duration::from_secs(600),
            default_pool: PoolConfig::default(),
        }
    }
}

struct ManagedPool {
    pool: Arc<ConnectionPool>,
    config: ConnectionConfig,
    last_access: Instant,
}

/// One [`ConnectionPool`] per account.
pub struct PoolManager {
    pools: TokioMutex<HashMap<AccountId, ManagedPool>>,
    factory: Arc<dyn ConnectionFactory>,
    config: ManagerConfig,
    shutdown: CancellationToken,
    cleanup_task: StdMutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Creates the manager and starts its cleanup loop.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            pools: TokioMutex::new(HashMap::new()),
            factory,
            config,
            shutdown: CancellationToken::new(),
            cleanup_task: StdMutex::new(None),
        });

        let handle = tokio::spawn(Self::cleanup_loop(
            Arc::downgrade(&manager),
            manager.shutdown.clone(),
            manager.config.cleanup_interval,
        ));
        if let Ok(mut slot) = manager.cleanup_task.lock() {
            *slot = Some(handle);
        }
        manager
    }

    async fn cleanup_loop(manager: Weak<Self>, shutdown: CancellationToken, every: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    manager.cleanup_idle_pools().await;
                }
            }
        }
        debug!("Pool manager cleanup loop stopped");
    }

    /// Returns the account's pool, creating or rebuilding it as needed.
    ///
    /// Same server and username: the existing pool is kept and only its token
    /// fields are updated. Otherwise the old pool is closed and replaced.
    pub async fn get_pool(
        &self,
        account_id: AccountId,
        config: ConnectionConfig,
        options: Option<PoolConfig>,
    ) -> Arc<ConnectionPool> {
        let prefix = config.log_prefix();
        let mut pools = self.pools.lock().await;

        if let Some(managed) = pools.get_mut(&account_id) {
            managed.last_access = Instant::now();
            if managed.config.same_account(&config) {
                managed
                    .pool
                    .update_credentials(config.access_token.clone(), config.token_refresher.clone());
                managed.config = config;
                debug!("{} Reusing connection pool", prefix);
                return Arc::clone(&managed.pool);
            }
        }

        let pool = ConnectionPool::new(
            config.clone(),
            Arc::clone(&self.factory),
            options.unwrap_or_else(|| self.config.default_pool.clone()),
        );
        let replaced = pools.insert(
            account_id,
            ManagedPool {
                pool: Arc::clone(&pool),
                config,
                last_access: Instant::now(),
            },
        );
        drop(pools);

        if let Some(old) = replaced {
            info!("{} Account settings changed, rebuilding connection pool", prefix);
            old.pool.close().await;
        } else {
            debug!("{} Created connection pool", prefix);
        }
        pool
    }

    pub async fn close_pool(&self, account_id: AccountId) {
        let removed = self.pools.lock().await.remove(&account_id);
        if let Some(managed) = removed {
            managed.pool.close().await;
            info!("Closed connection pool for account {}", account_id);
        }
    }

    /// Stops the cleanup loop and closes every pool.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.cleanup_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained: Vec<(AccountId, ManagedPool)> = self.pools.lock().await.drain().collect();
        for (account_id, managed) in drained {
            managed.pool.close().await;
            debug!("Closed connection pool for account {}", account_id);
        }
    }

    /// Closes pools idle beyond `max_idle` that have no borrowed sessions.
    /// Returns the evicted account ids.
    pub async fn cleanup_idle_pools(&self) -> Vec<AccountId> {
        let mut evicted = Vec::new();
        {
            let mut pools = self.pools.lock().await;
            let mut idle_ids = Vec::new();
            for (account_id, managed) in pools.iter() {
                if managed.last_access.elapsed() > self.config.max_idle
                    && managed.pool.stats().await.in_use == 0
                {
                    idle_ids.push(*account_id);
                }
            }
            for account_id in idle_ids {
                if let Some(managed) = pools.remove(&account_id) {
                    evicted.push((account_id, managed.pool));
                }
            }
        }

        let mut ids = Vec::with_capacity(evicted.len());
        for (account_id, pool) in evicted {
            pool.close().await;
            info!("Closed idle connection pool for account {}", account_id);
            ids.push(account_id);
        }
        ids
    }

    pub async fn stats(&self) -> HashMap<AccountId, PoolStats> {
        let pools = self.pools.lock().await;
        let mut result = HashMap::with_capacity(pools.len());
        for (account_id, managed) in pools.iter() {
            result.insert(*account_id, managed.pool.stats().await);
        }
        result
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.lock().await.len()
    }
}
