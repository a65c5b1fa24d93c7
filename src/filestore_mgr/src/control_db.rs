use filestore_lib::{
    FilestoreId, FsError, FsResult, PoolId, ServerId, Shard, TenantId,
};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Filestore row as persisted in the control database. Capacity is in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilestoreRow {
    pub id: FilestoreId,
    pub uri: String,
    pub capacity_bytes: u64,
    pub max_entities: i64,
}

/// Filestore row joined with the number of tenants assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCandidateRow {
    pub row: FilestoreRow,
    pub tenant_count: u64,
}

fn db_err(context: &str, e: rusqlite::Error) -> FsError {
    warn!("ControlDB: {} failed! {}", context, e);
    FsError::DbError(format!("{} failed: {}", context, e))
}

fn to_db_size(bytes: u64) -> FsResult<i64> {
    i64::try_from(bytes).map_err(|_| FsError::CapacityTooLarge(bytes))
}

fn from_db_size(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn read_filestore_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilestoreRow> {
    Ok(FilestoreRow {
        id: row.get(0)?,
        uri: row.get(1)?,
        capacity_bytes: from_db_size(row.get(2)?),
        max_entities: row.get(3)?,
    })
}

/// The single control database: filestore master records, pool and cluster
/// topology, and the tenant assignments that tie tenants to a shard and a
/// filestore.
pub struct ControlDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl ControlDB {
    pub fn new(db_path: String) -> FsResult<Self> {
        debug!("ControlDB: open db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| db_err("open db", e))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS filestore (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                max_context INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS db_pool (
                db_pool_id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS db_cluster (
                cluster_id INTEGER PRIMARY KEY AUTOINCREMENT,
                read_db_pool_id INTEGER,
                write_db_pool_id INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 100,
                max_units INTEGER NOT NULL DEFAULT -1
            );
            CREATE TABLE IF NOT EXISTS context (
                cid INTEGER PRIMARY KEY,
                name TEXT,
                filestore_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS context_server2db_pool (
                cid INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                write_db_pool_id INTEGER NOT NULL,
                db_schema TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS context_filestore_idx ON context (filestore_id);",
        )
        .map_err(|e| db_err("create control tables", e))?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> FsResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FsError::Internal("control db connection poisoned".to_string()))
    }

    /// Run `f` inside one transaction holding the structural lock.
    ///
    /// SQLite has no row locks, so `BEGIN IMMEDIATE` takes the database write
    /// lock up front; `db_pool` and `db_cluster` are read inside the
    /// transaction so the lock covers them until commit or rollback.
    pub fn with_structure_lock<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("begin structure transaction", e))?;

        let pools: i64 = tx
            .query_row("SELECT COUNT(*) FROM db_pool", [], |row| row.get(0))
            .map_err(|e| db_err("lock db_pool", e))?;
        let clusters: i64 = tx
            .query_row("SELECT COUNT(*) FROM db_cluster", [], |row| row.get(0))
            .map_err(|e| db_err("lock db_cluster", e))?;
        debug!(
            "ControlDB: structure lock taken over {} pools, {} clusters",
            pools, clusters
        );

        // dropping tx on error rolls back
        let result = f(&tx)?;
        tx.commit().map_err(|e| db_err("commit", e))?;
        Ok(result)
    }

    // ==================== Filestore Rows ====================

    pub fn get_filestore(&self, id: FilestoreId) -> FsResult<FilestoreRow> {
        let conn = self.lock_conn()?;
        Self::query_filestore(&conn, id)
    }

    fn query_filestore(conn: &Connection, id: FilestoreId) -> FsResult<FilestoreRow> {
        conn.query_row(
            "SELECT id, uri, size, max_context FROM filestore WHERE id = ?1",
            params![id],
            read_filestore_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                FsError::NotFound(format!("filestore {} not found", id))
            }
            _ => db_err("query filestore", e),
        })
    }

    /// List filestores whose URI matches a SQL `LIKE` pattern (escape char `\`).
    pub fn list_filestores(&self, like_pattern: &str) -> FsResult<Vec<FilestoreRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, uri, size, max_context FROM filestore
                 WHERE uri LIKE ?1 ESCAPE '\\' ORDER BY id",
            )
            .map_err(|e| db_err("prepare list filestores", e))?;
        let rows = stmt
            .query_map(params![like_pattern], read_filestore_row)
            .map_err(|e| db_err("list filestores", e))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(|e| db_err("read filestore row", e))?);
        }
        Ok(result)
    }

    pub fn uri_in_use(
        tx: &Transaction<'_>,
        uri: &str,
        exclude_id: Option<FilestoreId>,
    ) -> FsResult<bool> {
        let found: Option<FilestoreId> = tx
            .query_row(
                "SELECT id FROM filestore WHERE uri = ?1 AND id != ?2",
                params![uri, exclude_id.unwrap_or(-1)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("query filestore uri", e))?;
        Ok(found.is_some())
    }

    pub fn insert_filestore(
        tx: &Transaction<'_>,
        uri: &str,
        capacity_bytes: u64,
        max_entities: i64,
    ) -> FsResult<FilestoreId> {
        tx.execute(
            "INSERT INTO filestore (uri, size, max_context) VALUES (?1, ?2, ?3)",
            params![uri, to_db_size(capacity_bytes)?, max_entities],
        )
        .map_err(|e| db_err("insert filestore", e))?;

        FilestoreId::try_from(tx.last_insert_rowid())
            .map_err(|_| FsError::Internal("filestore id sequence exhausted".to_string()))
    }

    pub fn load_filestore_in_tx(tx: &Transaction<'_>, id: FilestoreId) -> FsResult<FilestoreRow> {
        Self::query_filestore(tx, id)
    }

    pub fn update_filestore(tx: &Transaction<'_>, row: &FilestoreRow) -> FsResult<()> {
        let changed = tx
            .execute(
                "UPDATE filestore SET uri = ?1, size = ?2, max_context = ?3 WHERE id = ?4",
                params![
                    row.uri,
                    to_db_size(row.capacity_bytes)?,
                    row.max_entities,
                    row.id
                ],
            )
            .map_err(|e| db_err("update filestore", e))?;
        if changed == 0 {
            return Err(FsError::NotFound(format!("filestore {} not found", row.id)));
        }
        Ok(())
    }

    pub fn delete_filestore(tx: &Transaction<'_>, id: FilestoreId) -> FsResult<()> {
        let changed = tx
            .execute("DELETE FROM filestore WHERE id = ?1", params![id])
            .map_err(|e| db_err("delete filestore", e))?;
        if changed == 0 {
            return Err(FsError::NotFound(format!("filestore {} not found", id)));
        }
        Ok(())
    }

    pub fn tenants_on_filestore(tx: &Transaction<'_>, id: FilestoreId) -> FsResult<u64> {
        let count: i64 = tx
            .query_row(
                "SELECT COUNT(cid) FROM context WHERE filestore_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count tenants on filestore", e))?;
        Ok(from_db_size(count))
    }

    // ==================== Entity Counts ====================

    /// Enabled filestores joined with their live tenant count, least loaded first.
    pub fn tenant_candidates(&self) -> FsResult<Vec<TenantCandidateRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT filestore.id, filestore.uri, filestore.size, filestore.max_context,
                        COUNT(context.cid) AS num
                 FROM filestore LEFT JOIN context ON filestore.id = context.filestore_id
                 WHERE filestore.max_context > 0
                 GROUP BY filestore.id
                 ORDER BY num ASC, filestore.id ASC",
            )
            .map_err(|e| db_err("prepare tenant candidates", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TenantCandidateRow {
                    row: read_filestore_row(row)?,
                    tenant_count: from_db_size(row.get(4)?),
                })
            })
            .map_err(|e| db_err("query tenant candidates", e))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(|e| db_err("read tenant candidate", e))?);
        }
        Ok(result)
    }

    /// Number of tenants assigned to each filestore that has at least one.
    pub fn tenant_counts(&self) -> FsResult<HashMap<FilestoreId, u64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT filestore_id, COUNT(cid) FROM context GROUP BY filestore_id")
            .map_err(|e| db_err("prepare tenant counts", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, FilestoreId>(0)?, from_db_size(row.get(1)?)))
            })
            .map_err(|e| db_err("query tenant counts", e))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (id, count) = row.map_err(|e| db_err("read tenant count", e))?;
            counts.insert(id, count);
        }
        Ok(counts)
    }

    // ==================== Topology ====================

    pub fn register_pool(&self, pool_id: PoolId, url: &str, name: &str) -> FsResult<()> {
        self.with_structure_lock(|tx| {
            tx.execute(
                "INSERT INTO db_pool (db_pool_id, url, name) VALUES (?1, ?2, ?3)",
                params![pool_id, url, name],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    FsError::AlreadyExists(format!("db pool {} already registered", pool_id))
                }
                _ => db_err("insert db pool", e),
            })?;
            Ok(())
        })
    }

    pub fn register_cluster(
        &self,
        write_pool_id: PoolId,
        read_pool_id: Option<PoolId>,
    ) -> FsResult<i64> {
        self.with_structure_lock(|tx| {
            let known: Option<PoolId> = tx
                .query_row(
                    "SELECT db_pool_id FROM db_pool WHERE db_pool_id = ?1",
                    params![write_pool_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| db_err("query db pool", e))?;
            if known.is_none() {
                return Err(FsError::NotFound(format!(
                    "db pool {} not registered",
                    write_pool_id
                )));
            }

            tx.execute(
                "INSERT INTO db_cluster (read_db_pool_id, write_db_pool_id) VALUES (?1, ?2)",
                params![read_pool_id, write_pool_id],
            )
            .map_err(|e| db_err("insert db cluster", e))?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Record that `tenant_id` lives on `shard` and stores its files in `filestore_id`.
    pub fn bind_tenant(
        &self,
        server_id: ServerId,
        tenant_id: TenantId,
        filestore_id: FilestoreId,
        shard: &Shard,
    ) -> FsResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(|e| db_err("begin transaction", e))?;
        Self::query_filestore(&tx, filestore_id)?;

        tx.execute(
            "INSERT OR REPLACE INTO context (cid, name, filestore_id) VALUES (?1, ?2, ?3)",
            params![tenant_id, tenant_id.to_string(), filestore_id],
        )
        .map_err(|e| db_err("insert context", e))?;
        tx.execute(
            "INSERT OR REPLACE INTO context_server2db_pool (cid, server_id, write_db_pool_id, db_schema)
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, server_id, shard.pool_id, shard.schema],
        )
        .map_err(|e| db_err("insert context_server2db_pool", e))?;

        tx.commit().map_err(|e| db_err("commit", e))?;
        Ok(())
    }

    pub fn unbind_tenant(&self, tenant_id: TenantId) -> FsResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(|e| db_err("begin transaction", e))?;
        tx.execute(
            "DELETE FROM context_server2db_pool WHERE cid = ?1",
            params![tenant_id],
        )
        .map_err(|e| db_err("delete context_server2db_pool", e))?;
        tx.execute("DELETE FROM context WHERE cid = ?1", params![tenant_id])
            .map_err(|e| db_err("delete context", e))?;
        tx.commit().map_err(|e| db_err("commit", e))?;
        Ok(())
    }

    /// Shards that hold tenants of `server_id`, ordered by pool id and schema.
    pub fn list_shards(&self, server_id: ServerId) -> FsResult<Vec<Shard>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT write_db_pool_id, db_schema FROM context_server2db_pool
                 WHERE server_id = ?1 ORDER BY write_db_pool_id, db_schema",
            )
            .map_err(|e| db_err("prepare list shards", e))?;
        let rows = stmt
            .query_map(params![server_id], |row| {
                Ok(Shard::new(row.get(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| db_err("list shards", e))?;

        let mut shards = Vec::new();
        for row in rows {
            shards.push(row.map_err(|e| db_err("read shard row", e))?);
        }
        Ok(shards)
    }

    /// Filestore of every tenant hosted by `server_id`.
    pub fn tenant_filestores(&self, server_id: ServerId) -> FsResult<HashMap<TenantId, FilestoreId>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT context.cid, context.filestore_id FROM context
                 JOIN context_server2db_pool ON context.cid = context_server2db_pool.cid
                 WHERE context_server2db_pool.server_id = ?1",
            )
            .map_err(|e| db_err("prepare tenant filestores", e))?;
        let rows = stmt
            .query_map(params![server_id], |row| {
                Ok((row.get::<_, TenantId>(0)?, row.get::<_, FilestoreId>(1)?))
            })
            .map_err(|e| db_err("query tenant filestores", e))?;

        let mut result = HashMap::new();
        for row in rows {
            let (tenant_id, filestore_id) = row.map_err(|e| db_err("read tenant filestore", e))?;
            result.insert(tenant_id, filestore_id);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (ControlDB, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("control.db");
        let db = ControlDB::new(db_path.to_string_lossy().to_string()).unwrap();
        (db, tmp)
    }

    fn add_filestore(db: &ControlDB, uri: &str, max_entities: i64) -> FilestoreId {
        db.with_structure_lock(|tx| ControlDB::insert_filestore(tx, uri, 1 << 30, max_entities))
            .unwrap()
    }

    #[test]
    fn test_failed_structure_transaction_rolls_back() {
        let (db, _tmp) = create_test_db();
        let result: FsResult<()> = db.with_structure_lock(|tx| {
            ControlDB::insert_filestore(tx, "file:///rollback", 1024, 1)?;
            Err(FsError::InvalidParam("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.list_filestores("%").unwrap().is_empty());
    }

    #[test]
    fn test_tenant_candidates_order_and_exclusion() {
        let (db, _tmp) = create_test_db();
        let shard = Shard::new(1, "oxdb_1");
        let busy = add_filestore(&db, "file:///busy", 10);
        let idle = add_filestore(&db, "file:///idle", 10);
        let disabled = add_filestore(&db, "file:///disabled", 0);

        db.bind_tenant(1, 1, busy, &shard).unwrap();
        db.bind_tenant(1, 2, busy, &shard).unwrap();
        db.bind_tenant(1, 3, disabled, &shard).unwrap();

        let candidates = db.tenant_candidates().unwrap();
        let ids: Vec<FilestoreId> = candidates.iter().map(|c| c.row.id).collect();
        assert_eq!(ids, vec![idle, busy]);
        assert_eq!(candidates[0].tenant_count, 0);
        assert_eq!(candidates[1].tenant_count, 2);

        let counts = db.tenant_counts().unwrap();
        assert_eq!(counts.get(&busy), Some(&2));
        assert_eq!(counts.get(&disabled), Some(&1));
        assert_eq!(counts.get(&idle), None);
    }

    #[test]
    fn test_topology() {
        let (db, _tmp) = create_test_db();
        let fs = add_filestore(&db, "file:///a", 10);
        db.register_pool(2, "sqlite://pool2", "pool2").unwrap();
        assert!(matches!(
            db.register_pool(2, "sqlite://pool2", "pool2"),
            Err(FsError::AlreadyExists(_))
        ));
        db.register_cluster(2, None).unwrap();
        assert!(matches!(
            db.register_cluster(5, None),
            Err(FsError::NotFound(_))
        ));

        db.bind_tenant(1, 10, fs, &Shard::new(2, "oxdb_b")).unwrap();
        db.bind_tenant(1, 11, fs, &Shard::new(2, "oxdb_a")).unwrap();
        db.bind_tenant(1, 12, fs, &Shard::new(2, "oxdb_a")).unwrap();
        db.bind_tenant(2, 13, fs, &Shard::new(3, "oxdb_c")).unwrap();

        assert_eq!(
            db.list_shards(1).unwrap(),
            vec![Shard::new(2, "oxdb_a"), Shard::new(2, "oxdb_b")]
        );
        let tenants = db.tenant_filestores(1).unwrap();
        assert_eq!(tenants.len(), 3);
        assert!(!tenants.contains_key(&13));

        db.unbind_tenant(10).unwrap();
        assert_eq!(db.list_shards(1).unwrap(), vec![Shard::new(2, "oxdb_a")]);

        assert!(db
            .bind_tenant(1, 20, 999, &Shard::new(2, "oxdb_a"))
            .unwrap_err()
            .is_not_found());
    }
}
