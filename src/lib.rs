// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Library core for mailsweep: bulk, filtered IMAP deletion.

pub mod account;
pub mod cleaner;
pub mod config;
pub mod connection_pool;
pub mod imap;
pub mod net;
pub mod pool_manager;
pub mod utils;

pub mod prelude {
    pub use crate::account::{AccountId, TokenManager};
    pub use crate::cleaner::{CleanProgress, CleanRequest, CleanResult, Cleaner};
    pub use crate::config::Settings;
    pub use crate::connection_pool::{ConnectionPool, PoolConfig};
    pub use crate::imap::{ConnectionConfig, ImapError, MailSession};
    pub use crate::pool_manager::PoolManager;
}
