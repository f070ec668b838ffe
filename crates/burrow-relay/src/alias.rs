//! Alias allocation
//!
//! Aliases are `<prefix>-<12 lowercase hex>` labels; the prefix round-robins
//! over a fixed list so consecutive allocations visibly differ. Known users
//! get a stable alias per (user, port) persisted in storage, bounded by a
//! quota; anonymous, unknown and over-quota registrations fall through to a
//! fresh ephemeral alias.

use crate::registry::TunnelRegistry;
use burrow_db::Store;
use rand::Rng;
use sea_orm::DbErr;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sentinel user for agents registering without a token
pub const ANONYMOUS_USER: &str = "anonymous";

/// Round-robin prefixes for fresh aliases
const ALIAS_PREFIXES: [&str; 6] = ["client", "user", "web", "site", "app", "people"];

/// Allocation errors. Storage failures surface as registration failures.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Storage error during alias allocation: {0}")]
    Storage(#[from] DbErr),
}

/// The outcome of an allocation
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedAlias {
    pub alias: String,
    /// Whether the (user, alias, port) row is persisted in storage
    pub persisted: bool,
}

/// Allocates collision-free public aliases and owns their persistence
pub struct AliasAllocator {
    store: Store,
    registry: Arc<TunnelRegistry>,
    quota: u64,
    prefix_cursor: AtomicUsize,
}

impl AliasAllocator {
    pub fn new(store: Store, registry: Arc<TunnelRegistry>, quota: u64) -> Self {
        Self {
            store,
            registry,
            quota,
            prefix_cursor: AtomicUsize::new(0),
        }
    }

    /// Allocate an alias for a registration.
    ///
    /// 1. Anonymous or unknown users get a fresh ephemeral alias.
    /// 2. A persisted row for (user, port) is reused.
    /// 3. At or over quota, the user gets a fresh ephemeral alias.
    /// 4. Otherwise a fresh alias is generated and persisted.
    pub async fn allocate(&self, user: &str, port: u16) -> Result<AllocatedAlias, AllocError> {
        if user == ANONYMOUS_USER {
            return Ok(AllocatedAlias {
                alias: self.fresh_alias(),
                persisted: false,
            });
        }

        let Some(user_row) = self.store.find_user_by_token(user).await? else {
            debug!(user = %user, "Unknown user token, allocating ephemeral alias");
            return Ok(AllocatedAlias {
                alias: self.fresh_alias(),
                persisted: false,
            });
        };

        if let Some(row) = self.store.find_alias(user_row.id, port as i32).await? {
            info!(user = %user, port = port, alias = %row.alias, "Restored persisted alias");
            return Ok(AllocatedAlias {
                alias: row.alias,
                persisted: true,
            });
        }

        let held = self.store.count_aliases(user_row.id).await?;
        if held >= self.quota {
            warn!(
                user = %user,
                held = held,
                quota = self.quota,
                "Alias quota reached, allocating ephemeral alias"
            );
            return Ok(AllocatedAlias {
                alias: self.fresh_alias(),
                persisted: false,
            });
        }

        let alias = self.fresh_alias();
        self.store
            .insert_alias(user_row.id, &alias, port as i32)
            .await?;
        info!(user = %user, port = port, alias = %alias, "Persisted new alias");

        Ok(AllocatedAlias {
            alias,
            persisted: true,
        })
    }

    /// Generate a fresh alias not currently registered. Retries on the
    /// astronomically rare collision with a live alias.
    fn fresh_alias(&self) -> String {
        loop {
            let index = self.prefix_cursor.fetch_add(1, Ordering::Relaxed);
            let prefix = ALIAS_PREFIXES[index % ALIAS_PREFIXES.len()];

            let mut bytes = [0u8; 6];
            rand::thread_rng().fill(&mut bytes);
            let mut label = String::with_capacity(prefix.len() + 13);
            label.push_str(prefix);
            label.push('-');
            for byte in bytes {
                let _ = write!(label, "{:02x}", byte);
            }

            if !self.registry.alias_in_use(&label) {
                return label;
            }
        }
    }
}
