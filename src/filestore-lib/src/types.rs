use serde::{Deserialize, Serialize};
use std::fmt;

pub type FilestoreId = i32;
pub type TenantId = i32;
pub type AccountId = i32;
pub type PoolId = i32;
pub type ServerId = i32;

/// Account id carried by tenant-level usage rows.
pub const TENANT_LEVEL_ACCOUNT: AccountId = 0;

/// One horizontally partitioned database: a write pool plus a schema inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    pub pool_id: PoolId,
    pub schema: String,
}

impl Shard {
    pub fn new(pool_id: PoolId, schema: impl Into<String>) -> Self {
        Self {
            pool_id,
            schema: schema.into(),
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool_id, self.schema)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Tenant,
    Account,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Tenant => "tenant",
            EntityKind::Account => "account",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filestore as seen by callers. Sizes are in megabytes.
///
/// `entity_count`, `used_mb` and `reserved_mb` are filled by the operation that
/// returned the value and are ignored on registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filestore {
    pub id: FilestoreId,
    pub uri: String,
    pub size_mb: u64,
    /// 0 disables the filestore for new allocations.
    pub max_entities: i64,
    pub entity_count: u64,
    pub used_mb: u64,
    pub reserved_mb: u64,
}

impl Filestore {
    pub fn new(uri: impl Into<String>, size_mb: u64, max_entities: i64) -> Self {
        Self {
            uri: uri.into(),
            size_mb,
            max_entities,
            ..Default::default()
        }
    }

    pub fn accepts_new_entities(&self) -> bool {
        self.max_entities > 0
    }
}

/// Partial change of a registered filestore; `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilestoreUpdate {
    pub id: FilestoreId,
    pub uri: Option<String>,
    pub size_mb: Option<u64>,
    pub max_entities: Option<i64>,
}

impl FilestoreUpdate {
    pub fn new(id: FilestoreId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uri.is_none() && self.size_mb.is_none() && self.max_entities.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shard_identity_uses_pool_and_schema() {
        let mut set = HashSet::new();
        set.insert(Shard::new(1, "oxdb_1"));
        set.insert(Shard::new(1, "oxdb_1"));
        set.insert(Shard::new(2, "oxdb_1"));
        set.insert(Shard::new(1, "oxdb_2"));
        assert_eq!(set.len(), 3);
        assert_eq!(Shard::new(4, "oxdb_9").to_string(), "4/oxdb_9");
    }

    #[test]
    fn test_disabled_filestore() {
        assert!(!Filestore::new("file:///a", 100, 0).accepts_new_entities());
        assert!(Filestore::new("file:///a", 100, 1).accepts_new_entities());
        assert!(FilestoreUpdate::new(1).is_empty());
    }
}
