use crate::shard_catalog::ShardConnector;
use filestore_lib::{FsError, FsResult, Shard};
use log::{debug, warn};
use rusqlite::OptionalExtension;
use std::sync::Arc;

/// Reports whether a shard is blocked by a schema update.
pub trait MigrationStatus: Send + Sync {
    fn is_locked_or_needs_migration(&self, shard: &Shard) -> FsResult<bool>;
}

/// Reads the `schema_status` row kept inside every shard.
///
/// A shard is blocked when it is locked by a running update or its version is
/// below `required_version`. A shard without a status row has never been
/// migrated and counts as blocked.
pub struct SchemaStatusTable {
    connector: Arc<dyn ShardConnector>,
    required_version: i64,
}

impl SchemaStatusTable {
    pub fn new(connector: Arc<dyn ShardConnector>, required_version: i64) -> Self {
        Self {
            connector,
            required_version,
        }
    }
}

impl MigrationStatus for SchemaStatusTable {
    fn is_locked_or_needs_migration(&self, shard: &Shard) -> FsResult<bool> {
        let conn = self.connector.connect(shard)?;
        let status: Option<(i64, i64)> = conn
            .query_row(
                "SELECT version, locked FROM schema_status ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| {
                warn!("SchemaStatusTable: read status of {} failed! {}", shard, e);
                FsError::unavailable_shard(shard, e)
            })?;

        let blocked = match status {
            Some((version, locked)) => locked != 0 || version < self.required_version,
            None => true,
        };
        debug!(
            "SchemaStatusTable: shard {} status {:?}, blocked: {}",
            shard, status, blocked
        );
        Ok(blocked)
    }
}

/// Gate in front of exact usage reads.
#[derive(Clone)]
pub struct ShardGuard {
    status: Arc<dyn MigrationStatus>,
}

impl ShardGuard {
    pub fn new(status: Arc<dyn MigrationStatus>) -> Self {
        Self { status }
    }

    pub fn is_locked_or_needs_migration(&self, shard: &Shard) -> FsResult<bool> {
        self.status.is_locked_or_needs_migration(shard)
    }

    /// Fail with `SchemaNeedsUpdate` when `shard` must not be read.
    pub fn check(&self, shard: &Shard) -> FsResult<()> {
        if self.is_locked_or_needs_migration(shard)? {
            warn!("ShardGuard: shard {} is locked or needs migration", shard);
            return Err(FsError::schema_needs_update(shard));
        }
        Ok(())
    }
}
