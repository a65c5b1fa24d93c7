mod allocator;
mod control_db;
mod filestore_mgr;
mod filestore_registry;
mod shard_catalog;
mod shard_guard;
mod usage_aggregator;
mod usage_block;
mod usage_fanout;

#[cfg(test)]
mod test_fixture;

pub use allocator::*;
pub use control_db::{ControlDB, FilestoreRow, TenantCandidateRow};
pub use filestore_mgr::*;
pub use filestore_registry::{like_pattern, FilestoreRegistry};
pub use shard_catalog::*;
pub use shard_guard::*;
pub use usage_aggregator::*;
pub use usage_block::*;
pub use usage_fanout::UsageFanOut;
