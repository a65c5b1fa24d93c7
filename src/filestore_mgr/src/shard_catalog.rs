use crate::control_db::ControlDB;
use crate::shard_guard::ShardGuard;
use filestore_lib::{FilestoreId, FsError, FsResult, ServerId, Shard, TenantId};
use log::{debug, warn};
use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SHARD_DB_EXT: &str = "db";
const DEFAULT_MAX_IDLE_PER_SHARD: usize = 4;

/// Opens connections to shards. Implementations decide where a shard lives.
pub trait ShardConnector: Send + Sync {
    /// Failures must surface as [`FsError::UnavailableShard`].
    fn connect(&self, shard: &Shard) -> FsResult<ShardConnection>;
}

trait ConnectionRelease: Send + Sync {
    fn release(&self, shard: &Shard, conn: Connection);
}

/// Scoped shard connection. Dropping it hands the connection back to the pool
/// it came from (or closes it when it is unpooled).
pub struct ShardConnection {
    shard: Shard,
    conn: Option<Connection>,
    pool: Option<Arc<dyn ConnectionRelease>>,
}

impl ShardConnection {
    pub fn unpooled(shard: Shard, conn: Connection) -> Self {
        Self {
            shard,
            conn: Some(conn),
            pool: None,
        }
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }
}

impl Deref for ShardConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // only taken in drop
        self.conn.as_ref().expect("shard connection already released")
    }
}

impl Drop for ShardConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(pool)) = (self.conn.take(), self.pool.as_ref()) {
            pool.release(&self.shard, conn);
        }
    }
}

struct IdleConnections {
    conns: Mutex<HashMap<Shard, Vec<Connection>>>,
    max_idle_per_shard: usize,
}

impl IdleConnections {
    fn take(&self, shard: &Shard) -> Option<Connection> {
        let mut conns = self.conns.lock().ok()?;
        conns.get_mut(shard).and_then(|idle| idle.pop())
    }

    fn idle_count(&self, shard: &Shard) -> usize {
        self.conns
            .lock()
            .map(|conns| conns.get(shard).map(|idle| idle.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ConnectionRelease for IdleConnections {
    fn release(&self, shard: &Shard, conn: Connection) {
        let Ok(mut conns) = self.conns.lock() else {
            return;
        };
        let idle = conns.entry(shard.clone()).or_default();
        if idle.len() < self.max_idle_per_shard {
            idle.push(conn);
        }
    }
}

/// Shard connector over SQLite files laid out as `<root>/pool_<id>/<schema>.db`.
///
/// A shard whose file does not exist is unavailable; it is never created here.
pub struct SqliteShardConnector {
    shard_root: PathBuf,
    busy_timeout: Duration,
    idle: Arc<IdleConnections>,
}

impl SqliteShardConnector {
    pub fn new(shard_root: PathBuf, busy_timeout: Duration) -> Self {
        Self {
            shard_root,
            busy_timeout,
            idle: Arc::new(IdleConnections {
                conns: Mutex::new(HashMap::new()),
                max_idle_per_shard: DEFAULT_MAX_IDLE_PER_SHARD,
            }),
        }
    }

    pub fn shard_db_path(&self, shard: &Shard) -> PathBuf {
        shard_db_path(&self.shard_root, shard)
    }

    pub fn idle_connections(&self, shard: &Shard) -> usize {
        self.idle.idle_count(shard)
    }

    fn open(&self, shard: &Shard) -> FsResult<Connection> {
        let path = self.shard_db_path(shard);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            warn!(
                "SqliteShardConnector: open shard {} at {} failed! {}",
                shard,
                path.display(),
                e
            );
            FsError::unavailable_shard(shard, e)
        })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| FsError::unavailable_shard(shard, e))?;
        debug!("SqliteShardConnector: opened shard {}", shard);
        Ok(conn)
    }
}

impl ShardConnector for SqliteShardConnector {
    fn connect(&self, shard: &Shard) -> FsResult<ShardConnection> {
        let conn = match self.idle.take(shard) {
            Some(conn) => conn,
            None => self.open(shard)?,
        };
        let pool: Arc<dyn ConnectionRelease> = self.idle.clone();
        Ok(ShardConnection {
            shard: shard.clone(),
            conn: Some(conn),
            pool: Some(pool),
        })
    }
}

pub fn shard_db_path(shard_root: &Path, shard: &Shard) -> PathBuf {
    shard_root
        .join(format!("pool_{}", shard.pool_id))
        .join(format!("{}.{}", shard.schema, SHARD_DB_EXT))
}

/// Create a shard database with the accounting tables at `schema_version`.
///
/// Provisioning of shards belongs to the schema tooling; this is the layout it
/// is expected to produce.
pub fn create_shard_db(shard_root: &Path, shard: &Shard, schema_version: i64) -> FsResult<PathBuf> {
    let path = shard_db_path(shard_root, shard);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| FsError::IoError(format!("create shard dir failed: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| FsError::unavailable_shard(shard, e))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS filestore_usage (
            cid INTEGER NOT NULL,
            user INTEGER NOT NULL DEFAULT 0,
            used INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (cid, user)
        );
        CREATE TABLE IF NOT EXISTS user (
            cid INTEGER NOT NULL,
            id INTEGER NOT NULL,
            filestore_id INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (cid, id)
        );
        CREATE TABLE IF NOT EXISTS schema_status (
            version INTEGER NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        );",
    )
    .map_err(|e| {
        warn!("create shard tables for {} failed! {}", shard, e);
        FsError::DbError(e.to_string())
    })?;
    conn.execute("DELETE FROM schema_status", [])
        .and_then(|_| {
            conn.execute(
                "INSERT INTO schema_status (version, locked) VALUES (?1, 0)",
                [schema_version],
            )
        })
        .map_err(|e| FsError::DbError(e.to_string()))?;

    Ok(path)
}

/// Known shards of one server and the means to reach them.
pub struct ShardCatalog {
    control: Arc<ControlDB>,
    connector: Arc<dyn ShardConnector>,
    guard: ShardGuard,
    server_id: ServerId,
}

impl ShardCatalog {
    pub fn new(
        control: Arc<ControlDB>,
        connector: Arc<dyn ShardConnector>,
        guard: ShardGuard,
        server_id: ServerId,
    ) -> Self {
        Self {
            control,
            connector,
            guard,
            server_id,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn connector(&self) -> Arc<dyn ShardConnector> {
        self.connector.clone()
    }

    pub fn guard(&self) -> &ShardGuard {
        &self.guard
    }

    pub fn list_shards(&self) -> FsResult<BTreeSet<Shard>> {
        let shards = self.control.list_shards(self.server_id)?;
        Ok(shards.into_iter().collect())
    }

    pub fn connect(&self, shard: &Shard) -> FsResult<ShardConnection> {
        self.connector.connect(shard)
    }

    pub fn is_locked_or_needs_migration(&self, shard: &Shard) -> FsResult<bool> {
        self.guard.is_locked_or_needs_migration(shard)
    }

    /// Filestore of every tenant on this server, read once per aggregation pass.
    pub fn tenant_filestores(&self) -> FsResult<HashMap<TenantId, FilestoreId>> {
        self.control.tenant_filestores(self.server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_shard_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let connector =
            SqliteShardConnector::new(tmp.path().to_path_buf(), Duration::from_millis(100));
        let shard = Shard::new(9, "oxdb_missing");

        match connector.connect(&shard) {
            Err(FsError::UnavailableShard { pool_id, schema, .. }) => {
                assert_eq!(pool_id, 9);
                assert_eq!(schema, "oxdb_missing");
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("missing shard must not be created"),
        }
        assert!(!connector.shard_db_path(&shard).exists());
    }

    #[test]
    fn test_connection_returned_on_drop() {
        let tmp = TempDir::new().unwrap();
        let shard = Shard::new(1, "oxdb_1");
        create_shard_db(tmp.path(), &shard, 1).unwrap();
        let connector =
            SqliteShardConnector::new(tmp.path().to_path_buf(), Duration::from_millis(100));

        {
            let conn = connector.connect(&shard).unwrap();
            assert_eq!(conn.shard(), &shard);
            let version: i64 = conn
                .query_row("SELECT version FROM schema_status", [], |row| row.get(0))
                .unwrap();
            assert_eq!(version, 1);
            assert_eq!(connector.idle_connections(&shard), 0);
        }
        assert_eq!(connector.idle_connections(&shard), 1);

        // early return through `?` still releases
        let failing = || -> FsResult<()> {
            let conn = connector.connect(&shard)?;
            conn.execute("INSERT INTO no_such_table VALUES (1)", [])
                .map_err(|e| FsError::unavailable_shard(&shard, e))?;
            Ok(())
        };
        assert!(failing().is_err());
        assert_eq!(connector.idle_connections(&shard), 1);

        let a = connector.connect(&shard).unwrap();
        let b = connector.connect(&shard).unwrap();
        drop(a);
        drop(b);
        assert_eq!(connector.idle_connections(&shard), 2);
    }
}
