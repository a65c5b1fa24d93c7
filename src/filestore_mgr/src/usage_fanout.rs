use crate::shard_catalog::{ShardConnection, ShardConnector};
use crate::shard_guard::ShardGuard;
use crate::usage_block::{UsageAccumulator, UsageBlock, UsageBlockKey, UsageRow};
use dashmap::DashMap;
use filestore_lib::{AccountId, FilestoreId, FsError, FsResult, Shard, TenantId};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

fn query_err(shard: &Shard, context: &str, e: rusqlite::Error) -> FsError {
    warn!("UsageFanOut: {} on shard {} failed! {}", context, shard, e);
    FsError::unavailable_shard(shard, format!("{}: {}", context, e))
}

fn non_negative(shard: &Shard, value: i64) -> u64 {
    u64::try_from(value).unwrap_or_else(|_| {
        warn!("UsageFanOut: negative value {} on shard {}", value, shard);
        0
    })
}

/// Tenant-level usage rows: `(tenant id, bytes)`.
fn query_tenant_usage(conn: &ShardConnection) -> FsResult<Vec<(TenantId, u64)>> {
    let shard = conn.shard();
    let mut stmt = conn
        .prepare("SELECT cid, used FROM filestore_usage WHERE user = 0")
        .map_err(|e| query_err(shard, "prepare tenant usage", e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, TenantId>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| query_err(shard, "query tenant usage", e))?;

    let mut result = Vec::new();
    for row in rows {
        let (tenant_id, used) = row.map_err(|e| query_err(shard, "read tenant usage", e))?;
        result.push((tenant_id, non_negative(shard, used)));
    }
    Ok(result)
}

/// Usage rows of accounts that have their own filestore.
fn query_account_usage(conn: &ShardConnection) -> FsResult<Vec<UsageRow>> {
    let shard = conn.shard();
    let mut stmt = conn
        .prepare(
            "SELECT user.cid, user.id, user.filestore_id, filestore_usage.used
             FROM user JOIN filestore_usage
               ON filestore_usage.cid = user.cid AND filestore_usage.user = user.id
             WHERE user.filestore_id > 0",
        )
        .map_err(|e| query_err(shard, "prepare account usage", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, TenantId>(0)?,
                row.get::<_, AccountId>(1)?,
                row.get::<_, FilestoreId>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(|e| query_err(shard, "query account usage", e))?;

    let mut result = Vec::new();
    for row in rows {
        let (tenant_id, account_id, filestore_id, used) =
            row.map_err(|e| query_err(shard, "read account usage", e))?;
        result.push(UsageRow::account(
            tenant_id,
            account_id,
            filestore_id,
            non_negative(shard, used),
        ));
    }
    Ok(result)
}

fn query_account_assignments(conn: &ShardConnection) -> FsResult<Vec<(FilestoreId, u64)>> {
    let shard = conn.shard();
    let mut stmt = conn
        .prepare(
            "SELECT filestore_id, COUNT(*) FROM user WHERE filestore_id > 0 GROUP BY filestore_id",
        )
        .map_err(|e| query_err(shard, "prepare account assignments", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, FilestoreId>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| query_err(shard, "query account assignments", e))?;

    let mut result = Vec::new();
    for row in rows {
        let (filestore_id, count) =
            row.map_err(|e| query_err(shard, "read account assignments", e))?;
        result.push((filestore_id, non_negative(shard, count)));
    }
    Ok(result)
}

/// Scatter-gather over shards: one blocking read task per shard, at most
/// `max_workers` running at once, all-or-nothing result.
pub struct UsageFanOut {
    connector: Arc<dyn ShardConnector>,
    guard: ShardGuard,
    workers: Arc<Semaphore>,
}

impl UsageFanOut {
    pub fn new(connector: Arc<dyn ShardConnector>, guard: ShardGuard, max_workers: usize) -> Self {
        Self {
            connector,
            guard,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Run `task` once per distinct shard and wait for all of them. Returns
    /// the number of distinct shards read.
    ///
    /// The first failure is returned as soon as it is observed. Tasks still
    /// waiting for a worker are dropped; tasks already reading finish in the
    /// background and their results are discarded.
    async fn run_per_shard<F>(&self, shards: &[Shard], task: F) -> FsResult<usize>
    where
        F: Fn(&Shard) -> FsResult<()> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let unique: BTreeSet<Shard> = shards.iter().cloned().collect();
        let shard_count = unique.len();
        let mut join_set = JoinSet::new();

        for shard in unique {
            let workers = self.workers.clone();
            let task = task.clone();
            join_set.spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| FsError::Internal(format!("fan-out pool closed: {}", e)))?;
                let blocking_shard = shard.clone();
                tokio::task::spawn_blocking(move || task(&blocking_shard))
                    .await
                    .map_err(|e| {
                        FsError::Internal(format!("usage task for shard {} failed: {}", shard, e))
                    })?
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("UsageFanOut: aborting aggregation: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("UsageFanOut: usage task join failed! {}", e);
                    return Err(FsError::Internal(format!("usage task join failed: {}", e)));
                }
            }
        }
        Ok(shard_count)
    }

    /// Exact usage of every (shard, filestore) pair.
    ///
    /// Each shard is checked by the guard before it is read; a blocked shard
    /// fails the whole call with `SchemaNeedsUpdate`.
    pub async fn aggregate_usage(
        &self,
        shards: &[Shard],
        tenant_filestores: Arc<HashMap<TenantId, FilestoreId>>,
    ) -> FsResult<HashMap<UsageBlockKey, UsageBlock>> {
        let started = Instant::now();
        let accumulator = UsageAccumulator::new();
        let connector = self.connector.clone();
        let guard = self.guard.clone();
        let task_accumulator = accumulator.clone();

        let shard_count = self.run_per_shard(shards, move |shard| {
            guard.check(shard)?;
            let conn = connector.connect(shard)?;

            for (tenant_id, used_bytes) in query_tenant_usage(&conn)? {
                match tenant_filestores.get(&tenant_id) {
                    Some(filestore_id) => task_accumulator
                        .record(shard, &UsageRow::tenant(tenant_id, *filestore_id, used_bytes)),
                    None => warn!(
                        "UsageFanOut: tenant {} on shard {} has no filestore assignment, {} bytes left out of the usage",
                        tenant_id, shard, used_bytes
                    ),
                }
            }
            for row in query_account_usage(&conn)? {
                task_accumulator.record(shard, &row);
            }
            Ok(())
        })
        .await?;

        let blocks = accumulator.into_blocks();
        info!(
            "UsageFanOut: aggregated {} usage blocks from {} shards in {:?}",
            blocks.len(),
            shard_count,
            started.elapsed()
        );
        Ok(blocks)
    }

    /// Number of accounts with their own filestore, per filestore.
    ///
    /// Only assignment rows are counted, so the guard is not consulted.
    pub async fn count_account_assignments(
        &self,
        shards: &[Shard],
    ) -> FsResult<HashMap<FilestoreId, u64>> {
        let counts: Arc<DashMap<FilestoreId, u64>> = Arc::new(DashMap::new());
        let connector = self.connector.clone();
        let task_counts = counts.clone();

        let shard_count = self.run_per_shard(shards, move |shard| {
            let conn = connector.connect(shard)?;
            for (filestore_id, count) in query_account_assignments(&conn)? {
                *task_counts.entry(filestore_id).or_insert(0) += count;
            }
            Ok(())
        })
        .await?;

        debug!(
            "UsageFanOut: counted account assignments for {} filestores from {} shards",
            counts.len(),
            shard_count
        );
        Ok(counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect())
    }
}
