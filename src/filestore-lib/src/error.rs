use crate::{PoolId, Shard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("still in use: {0}")]
    InUse(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("shard {pool_id}/{schema} unavailable: {reason}")]
    UnavailableShard {
        pool_id: PoolId,
        schema: String,
        reason: String,
    },

    #[error("schema {schema} in pool {pool_id} is locked or needs an update")]
    SchemaNeedsUpdate { pool_id: PoolId, schema: String },

    #[error("capacity of {0} bytes exceeds the storable maximum")]
    CapacityTooLarge(u64),

    #[error("no suitable filestore: {0}")]
    NoSuitableFilestore(String),
}

impl FsError {
    pub fn unavailable_shard(shard: &Shard, reason: impl ToString) -> Self {
        FsError::UnavailableShard {
            pool_id: shard.pool_id,
            schema: shard.schema.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn schema_needs_update(shard: &Shard) -> Self {
        FsError::SchemaNeedsUpdate {
            pool_id: shard.pool_id,
            schema: shard.schema.clone(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// The aggregate this error aborted cannot be trusted and should be retried later.
    pub fn is_shard_failure(&self) -> bool {
        matches!(
            self,
            FsError::UnavailableShard { .. } | FsError::SchemaNeedsUpdate { .. }
        )
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_errors_name_the_shard() {
        let shard = Shard::new(3, "oxdb_7");
        let err = FsError::schema_needs_update(&shard);
        assert!(err.is_shard_failure());
        assert_eq!(
            err.to_string(),
            "schema oxdb_7 in pool 3 is locked or needs an update"
        );

        let err = FsError::unavailable_shard(&shard, "connection refused");
        assert!(err.is_shard_failure());
        assert_eq!(
            err.to_string(),
            "shard 3/oxdb_7 unavailable: connection refused"
        );
    }

    #[test]
    fn test_not_found() {
        assert!(FsError::NotFound("filestore 9".to_string()).is_not_found());
        assert!(!FsError::InUse("filestore 9".to_string()).is_not_found());
        assert!(!FsError::CapacityTooLarge(1).is_shard_failure());
    }
}
