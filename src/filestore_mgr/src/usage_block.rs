use dashmap::DashMap;
use filestore_lib::{
    AccountId, FilestoreId, PoolId, Shard, TenantId, TENANT_LEVEL_ACCOUNT,
};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// One accounting row read from a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRow {
    pub tenant_id: TenantId,
    /// [`TENANT_LEVEL_ACCOUNT`] for tenant-level rows.
    pub account_id: AccountId,
    pub filestore_id: FilestoreId,
    pub used_bytes: u64,
}

impl UsageRow {
    pub fn tenant(tenant_id: TenantId, filestore_id: FilestoreId, used_bytes: u64) -> Self {
        Self {
            tenant_id,
            account_id: TENANT_LEVEL_ACCOUNT,
            filestore_id,
            used_bytes,
        }
    }

    pub fn account(
        tenant_id: TenantId,
        account_id: AccountId,
        filestore_id: FilestoreId,
        used_bytes: u64,
    ) -> Self {
        Self {
            tenant_id,
            account_id,
            filestore_id,
            used_bytes,
        }
    }

    pub fn is_tenant_level(&self) -> bool {
        self.account_id == TENANT_LEVEL_ACCOUNT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageBlockKey {
    pub pool_id: PoolId,
    pub schema: String,
    pub filestore_id: FilestoreId,
}

impl UsageBlockKey {
    pub fn new(shard: &Shard, filestore_id: FilestoreId) -> Self {
        Self {
            pool_id: shard.pool_id,
            schema: shard.schema.clone(),
            filestore_id,
        }
    }

    pub fn shard(&self) -> Shard {
        Shard::new(self.pool_id, self.schema.clone())
    }
}

/// Usage rows of one filestore seen on one shard.
///
/// Rows are stored by id, so replaying a row replaces it and never adds its
/// bytes twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageBlock {
    tenant_usage: HashMap<TenantId, u64>,
    account_usage: HashMap<(TenantId, AccountId), u64>,
}

impl UsageBlock {
    pub fn add_row(&mut self, row: &UsageRow) {
        let previous = if row.is_tenant_level() {
            self.tenant_usage.insert(row.tenant_id, row.used_bytes)
        } else {
            self.account_usage
                .insert((row.tenant_id, row.account_id), row.used_bytes)
        };

        if let Some(previous) = previous {
            if previous != row.used_bytes {
                warn!(
                    "UsageBlock: conflicting usage for tenant {} account {}: {} vs {}",
                    row.tenant_id, row.account_id, previous, row.used_bytes
                );
            }
        }
    }

    pub fn tenant_count(&self) -> u64 {
        self.tenant_usage.len() as u64
    }

    pub fn account_count(&self) -> u64 {
        self.account_usage.len() as u64
    }

    pub fn tenant_bytes(&self) -> u64 {
        self.tenant_usage.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn account_bytes(&self) -> u64 {
        self.account_usage.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn is_empty(&self) -> bool {
        self.tenant_usage.is_empty() && self.account_usage.is_empty()
    }
}

/// Concurrent map written by the fan-out tasks. The first writer of a key
/// creates its block, every later writer merges into the same block.
#[derive(Clone, Default)]
pub struct UsageAccumulator {
    blocks: Arc<DashMap<UsageBlockKey, UsageBlock>>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, shard: &Shard, row: &UsageRow) {
        self.blocks
            .entry(UsageBlockKey::new(shard, row.filestore_id))
            .or_default()
            .add_row(row);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn into_blocks(self) -> HashMap<UsageBlockKey, UsageBlock> {
        match Arc::try_unwrap(self.blocks) {
            Ok(blocks) => blocks.into_iter().collect(),
            Err(shared) => shared
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }
}
