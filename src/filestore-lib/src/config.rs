use crate::{mb_to_bytes, EntityKind, FsError, FsResult, ServerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_FILESTORE_CONFIG_PATH: &str = "/opt/filestore/etc/filestore.json";
pub const DEFAULT_AVERAGE_TENANT_SIZE_MB: u64 = 200;
pub const DEFAULT_AVERAGE_ACCOUNT_SIZE_MB: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilestoreConfig {
    /// Space reserved per tenant when estimating headroom.
    #[serde(alias = "average_context_size")]
    pub average_tenant_size_mb: u64,
    /// Space reserved per account with its own filestore.
    #[serde(alias = "average_user_size")]
    pub average_account_size_mb: u64,
    /// Upper bound of shards queried at the same time.
    pub max_fanout_workers: usize,
    /// Shards below this schema version are treated as mid-migration.
    pub required_schema_version: i64,
    /// Busy timeout handed to every shard connection.
    pub shard_busy_timeout_ms: u64,
    pub server_id: ServerId,
    #[serde(alias = "configdb_path")]
    pub control_db_path: PathBuf,
    pub shard_root: PathBuf,
}

impl Default for FilestoreConfig {
    fn default() -> Self {
        Self {
            average_tenant_size_mb: DEFAULT_AVERAGE_TENANT_SIZE_MB,
            average_account_size_mb: DEFAULT_AVERAGE_ACCOUNT_SIZE_MB,
            max_fanout_workers: 8,
            required_schema_version: 1,
            shard_busy_timeout_ms: 5000,
            server_id: 1,
            control_db_path: PathBuf::from("/opt/filestore/var/control.db"),
            shard_root: PathBuf::from("/opt/filestore/var/shards"),
        }
    }
}

impl FilestoreConfig {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> FsResult<Self> {
        if !path.exists() {
            info!(
                "filestore config {} not found, use default config",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!("read filestore config {} failed! {}", path.display(), e);
            FsError::IoError(format!("read config failed: {}", e))
        })?;
        let config = serde_json::from_str::<FilestoreConfig>(&content).map_err(|e| {
            warn!("parse filestore config {} failed! {}", path.display(), e);
            FsError::InvalidParam(format!("invalid filestore config: {}", e))
        })?;
        config.validate()?;
        debug!("filestore config loaded from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.average_tenant_size_mb == 0 {
            return Err(FsError::InvalidParam(
                "average_tenant_size_mb must be greater than 0".to_string(),
            ));
        }
        if self.average_account_size_mb == 0 {
            return Err(FsError::InvalidParam(
                "average_account_size_mb must be greater than 0".to_string(),
            ));
        }
        if self.max_fanout_workers == 0 {
            return Err(FsError::InvalidParam(
                "max_fanout_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn average_size_mb(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Tenant => self.average_tenant_size_mb,
            EntityKind::Account => self.average_account_size_mb,
        }
    }

    /// Heuristic size of one entity of `kind`, in bytes.
    pub fn heuristic_bytes(&self, kind: EntityKind) -> u64 {
        mb_to_bytes(self.average_size_mb(kind))
    }
}
