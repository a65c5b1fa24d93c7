use crate::allocator::{AllocationRequest, FilestoreAllocator};
use crate::control_db::ControlDB;
use crate::filestore_registry::FilestoreRegistry;
use crate::shard_catalog::{ShardCatalog, ShardConnector, SqliteShardConnector};
use crate::shard_guard::{MigrationStatus, SchemaStatusTable, ShardGuard};
use crate::usage_aggregator::{combine, entity_count_view, EntityCounts, FilestoreUsage};
use crate::usage_fanout::UsageFanOut;
use filestore_lib::{
    bytes_to_mb, EntityKind, Filestore, FilestoreConfig, FilestoreId, FsError, FsResult, Shard,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn ensure_parent_dir(path: &Path) -> FsResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                warn!("FilestoreMgr: create dir {} failed! {}", parent.display(), e);
                FsError::IoError(format!("create dir {} failed: {}", parent.display(), e))
            })?;
        }
    }
    Ok(())
}

/// Entry point of the filestore service for one server: registry, usage
/// aggregation and allocation share one control database and one set of shard
/// connections.
pub struct FilestoreMgr {
    config: FilestoreConfig,
    control: Arc<ControlDB>,
    registry: FilestoreRegistry,
    catalog: Arc<ShardCatalog>,
    fanout: Arc<UsageFanOut>,
    allocator: FilestoreAllocator,
}

impl FilestoreMgr {
    pub fn new(
        config: FilestoreConfig,
        control: Arc<ControlDB>,
        connector: Arc<dyn ShardConnector>,
        status: Arc<dyn MigrationStatus>,
    ) -> FsResult<Self> {
        config.validate()?;
        let guard = ShardGuard::new(status);
        let catalog = Arc::new(ShardCatalog::new(
            control.clone(),
            connector.clone(),
            guard.clone(),
            config.server_id,
        ));
        let fanout = Arc::new(UsageFanOut::new(
            connector,
            guard,
            config.max_fanout_workers,
        ));
        let allocator = FilestoreAllocator::new(
            control.clone(),
            catalog.clone(),
            fanout.clone(),
            config.clone(),
        );

        Ok(Self {
            registry: FilestoreRegistry::new(control.clone()),
            control,
            catalog,
            fanout,
            allocator,
            config,
        })
    }

    /// Build a manager over the SQLite control database and shard files named
    /// in `config`.
    pub fn open(config: FilestoreConfig) -> FsResult<Self> {
        config.validate()?;
        ensure_parent_dir(&config.control_db_path)?;
        let control = Arc::new(ControlDB::new(
            config.control_db_path.to_string_lossy().to_string(),
        )?);
        let connector = Arc::new(SqliteShardConnector::new(
            config.shard_root.clone(),
            Duration::from_millis(config.shard_busy_timeout_ms),
        ));
        let status = Arc::new(SchemaStatusTable::new(
            connector.clone(),
            config.required_schema_version,
        ));
        info!(
            "FilestoreMgr: opened control db {} for server {}, shards under {}",
            config.control_db_path.display(),
            config.server_id,
            config.shard_root.display()
        );
        Self::new(config, control, connector, status)
    }

    pub fn config(&self) -> &FilestoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &FilestoreRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ShardCatalog {
        &self.catalog
    }

    fn shards(&self) -> FsResult<Vec<Shard>> {
        Ok(self.catalog.list_shards()?.into_iter().collect())
    }

    /// Exact usage of every filestore that has at least one entity, read from
    /// all shards of this server.
    pub async fn filestore_usage(&self) -> FsResult<HashMap<FilestoreId, FilestoreUsage>> {
        let shards = self.shards()?;
        let tenant_filestores = Arc::new(self.catalog.tenant_filestores()?);
        let blocks = self
            .fanout
            .aggregate_usage(&shards, tenant_filestores)
            .await?;
        Ok(combine(&blocks))
    }

    /// Tenants and accounts per filestore, without reading usage rows.
    pub async fn entity_counts(&self) -> FsResult<HashMap<FilestoreId, EntityCounts>> {
        let tenant_counts = self.control.tenant_counts()?;
        let account_counts = self
            .fanout
            .count_account_assignments(&self.shards()?)
            .await?;
        Ok(entity_count_view(&tenant_counts, &account_counts))
    }

    /// Filestores whose URI matches `pattern`, annotated with their load.
    ///
    /// With `omit_usage` only entity counts and the reserved estimate are
    /// filled; otherwise every shard is read for the real used bytes.
    pub async fn list_filestores(&self, pattern: &str, omit_usage: bool) -> FsResult<Vec<Filestore>> {
        let mut filestores = self.registry.list(pattern)?;
        if filestores.is_empty() {
            return Ok(filestores);
        }

        if omit_usage {
            let counts = self.entity_counts().await?;
            let tenant_bytes = self.config.heuristic_bytes(EntityKind::Tenant);
            let account_bytes = self.config.heuristic_bytes(EntityKind::Account);
            for filestore in filestores.iter_mut() {
                let c = counts.get(&filestore.id).copied().unwrap_or_default();
                filestore.entity_count = c.total();
                filestore.reserved_mb = bytes_to_mb(
                    c.tenants
                        .saturating_mul(tenant_bytes)
                        .saturating_add(c.accounts.saturating_mul(account_bytes)),
                );
            }
        } else {
            let usage = self.filestore_usage().await?;
            for filestore in filestores.iter_mut() {
                let u = usage.get(&filestore.id).copied().unwrap_or_default();
                filestore.entity_count = u.entity_count;
                filestore.used_mb = bytes_to_mb(u.used_bytes);
            }
        }
        debug!(
            "FilestoreMgr: listed {} filestores for pattern '{}'",
            filestores.len(),
            pattern
        );
        Ok(filestores)
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> FsResult<Filestore> {
        self.allocator.allocate(request).await
    }

    /// Remove a filestore that no tenant and no account uses.
    pub async fn deregister(&self, id: FilestoreId) -> FsResult<()> {
        let accounts = self
            .fanout
            .count_account_assignments(&self.shards()?)
            .await?;
        if let Some(count) = accounts.get(&id).filter(|count| **count > 0) {
            warn!(
                "FilestoreMgr: filestore {} still used by {} accounts",
                id, count
            );
            return Err(FsError::InUse(format!(
                "filestore {} still used by {} accounts",
                id, count
            )));
        }
        self.registry.deregister(id)
    }
}
