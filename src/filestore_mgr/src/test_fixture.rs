use crate::control_db::ControlDB;
use crate::filestore_mgr::FilestoreMgr;
use crate::filestore_registry::FilestoreRegistry;
use crate::shard_catalog::{create_shard_db, ShardConnector, SqliteShardConnector};
use crate::shard_guard::{SchemaStatusTable, ShardGuard};
use crate::usage_fanout::UsageFanOut;
use filestore_lib::{
    mb_to_bytes, AccountId, Filestore, FilestoreConfig, FilestoreId, Shard, TenantId,
};
use rusqlite::params;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static INIT_LOGGER: Once = Once::new();

pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = simplelog::TestLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
    });
}

/// Control database plus SQLite shards under one temp dir.
pub struct TestEnv {
    pub tmp: TempDir,
    pub config: FilestoreConfig,
    pub control: Arc<ControlDB>,
    pub connector: Arc<SqliteShardConnector>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_logging();
        let tmp = TempDir::new().unwrap();
        let config = FilestoreConfig {
            control_db_path: tmp.path().join("control.db"),
            shard_root: tmp.path().join("shards"),
            max_fanout_workers: 2,
            required_schema_version: 1,
            shard_busy_timeout_ms: 200,
            ..Default::default()
        };
        let control = Arc::new(
            ControlDB::new(config.control_db_path.to_string_lossy().to_string()).unwrap(),
        );
        let connector = Arc::new(SqliteShardConnector::new(
            config.shard_root.clone(),
            Duration::from_millis(config.shard_busy_timeout_ms),
        ));
        Self {
            tmp,
            config,
            control,
            connector,
        }
    }

    pub fn add_shard(&self, pool_id: i32, schema: &str) -> Shard {
        let shard = Shard::new(pool_id, schema);
        create_shard_db(&self.config.shard_root, &shard, self.config.required_schema_version)
            .unwrap();
        shard
    }

    pub fn add_filestore(&self, uri: &str, size_mb: u64, max_entities: i64) -> FilestoreId {
        FilestoreRegistry::new(self.control.clone())
            .register(&Filestore::new(uri, size_mb, max_entities))
            .unwrap()
    }

    /// Bind a tenant to `shard` and `filestore_id` and write its tenant-level usage row.
    pub fn add_tenant(&self, shard: &Shard, tenant_id: TenantId, filestore_id: FilestoreId, used_mb: u64) {
        self.control
            .bind_tenant(self.config.server_id, tenant_id, filestore_id, shard)
            .unwrap();
        self.connector
            .connect(shard)
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO filestore_usage (cid, user, used) VALUES (?1, 0, ?2)",
                params![tenant_id, mb_to_bytes(used_mb) as i64],
            )
            .unwrap();
    }

    /// Account with its own filestore inside an existing tenant.
    pub fn add_account(
        &self,
        shard: &Shard,
        tenant_id: TenantId,
        account_id: AccountId,
        filestore_id: FilestoreId,
        used_mb: u64,
    ) {
        let conn = self.connector.connect(shard).unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO user (cid, id, filestore_id) VALUES (?1, ?2, ?3)",
            params![tenant_id, account_id, filestore_id],
        )
        .unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO filestore_usage (cid, user, used) VALUES (?1, ?2, ?3)",
            params![tenant_id, account_id, mb_to_bytes(used_mb) as i64],
        )
        .unwrap();
    }

    pub fn lock_shard(&self, shard: &Shard) {
        self.connector
            .connect(shard)
            .unwrap()
            .execute("UPDATE schema_status SET locked = 1", [])
            .unwrap();
    }

    pub fn guard(&self) -> ShardGuard {
        ShardGuard::new(Arc::new(SchemaStatusTable::new(
            self.connector.clone(),
            self.config.required_schema_version,
        )))
    }

    pub fn fanout(&self) -> UsageFanOut {
        UsageFanOut::new(
            self.connector.clone(),
            self.guard(),
            self.config.max_fanout_workers,
        )
    }

    pub fn mgr(&self) -> FilestoreMgr {
        let status = Arc::new(SchemaStatusTable::new(
            self.connector.clone(),
            self.config.required_schema_version,
        ));
        FilestoreMgr::new(
            self.config.clone(),
            self.control.clone(),
            self.connector.clone(),
            status,
        )
        .unwrap()
    }
}
