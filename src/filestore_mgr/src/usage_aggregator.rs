use crate::usage_block::{UsageBlock, UsageBlockKey};
use filestore_lib::{EntityKind, FilestoreId};
use std::collections::HashMap;

/// Aggregated usage of one filestore across all shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilestoreUsage {
    pub entity_count: u64,
    pub used_bytes: u64,
}

impl FilestoreUsage {
    fn add(&mut self, entities: u64, bytes: u64) {
        self.entity_count += entities;
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }
}

/// Entities currently assigned to a filestore, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub tenants: u64,
    pub accounts: u64,
}

impl EntityCounts {
    pub fn of_kind(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Tenant => self.tenants,
            EntityKind::Account => self.accounts,
        }
    }

    pub fn total(&self) -> u64 {
        self.tenants + self.accounts
    }
}

/// Combine the blocks of one aggregation pass into per-filestore totals.
///
/// Tenant and account usage are summed separately and merged at the end. The
/// result only depends on the set of blocks, not on the order they were built.
pub fn combine(blocks: &HashMap<UsageBlockKey, UsageBlock>) -> HashMap<FilestoreId, FilestoreUsage> {
    let mut tenant_totals: HashMap<FilestoreId, FilestoreUsage> = HashMap::new();
    let mut account_totals: HashMap<FilestoreId, FilestoreUsage> = HashMap::new();

    for (key, block) in blocks {
        if block.is_empty() {
            continue;
        }
        tenant_totals
            .entry(key.filestore_id)
            .or_default()
            .add(block.tenant_count(), block.tenant_bytes());
        account_totals
            .entry(key.filestore_id)
            .or_default()
            .add(block.account_count(), block.account_bytes());
    }

    for (filestore_id, accounts) in account_totals {
        tenant_totals
            .entry(filestore_id)
            .or_default()
            .add(accounts.entity_count, accounts.used_bytes);
    }
    tenant_totals
}

/// Cheap view: who is assigned where, without reading any usage row.
pub fn entity_count_view(
    tenant_counts: &HashMap<FilestoreId, u64>,
    account_counts: &HashMap<FilestoreId, u64>,
) -> HashMap<FilestoreId, EntityCounts> {
    let mut view: HashMap<FilestoreId, EntityCounts> = HashMap::new();
    for (id, count) in tenant_counts {
        view.entry(*id).or_default().tenants += count;
    }
    for (id, count) in account_counts {
        view.entry(*id).or_default().accounts += count;
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage_block::{UsageAccumulator, UsageRow};
    use filestore_lib::{mb_to_bytes, Shard};

    fn rows() -> Vec<UsageRow> {
        vec![
            UsageRow::tenant(1, 1, 100),
            UsageRow::tenant(2, 1, 250),
            UsageRow::tenant(3, 2, 75),
            UsageRow::account(1, 5, 2, 30),
            UsageRow::account(2, 5, 1, 12),
            UsageRow::account(2, 6, 1, 8),
            UsageRow::tenant(4, 3, 0),
        ]
    }

    fn blocks_for(partition: &[(Shard, Vec<UsageRow>)]) -> HashMap<UsageBlockKey, UsageBlock> {
        let acc = UsageAccumulator::new();
        for (shard, rows) in partition {
            for row in rows {
                acc.record(shard, row);
            }
        }
        acc.into_blocks()
    }

    #[test]
    fn test_three_shard_scenario() {
        let mb = mb_to_bytes(1);
        let blocks = blocks_for(&[
            (Shard::new(1, "oxdb_1"), vec![UsageRow::tenant(7, 1, 500 * mb)]),
            (Shard::new(2, "oxdb_2"), vec![UsageRow::tenant(9, 1, 300 * mb)]),
            (Shard::new(3, "oxdb_3"), vec![UsageRow::tenant(11, 2, 5 * mb)]),
        ]);

        let usage = combine(&blocks);
        assert_eq!(
            usage[&1],
            FilestoreUsage {
                entity_count: 2,
                used_bytes: 800 * mb
            }
        );
        assert_eq!(usage[&2].entity_count, 1);
    }

    #[test]
    fn test_partition_does_not_change_result() {
        let single = combine(&blocks_for(&[(Shard::new(1, "oxdb_1"), rows())]));

        let all = rows();
        let spread: Vec<(Shard, Vec<UsageRow>)> = all
            .iter()
            .enumerate()
            .map(|(i, row)| (Shard::new(i as i32 % 3, format!("oxdb_{}", i)), vec![*row]))
            .collect();
        assert_eq!(combine(&blocks_for(&spread)), single);

        let mut reversed = spread.clone();
        reversed.reverse();
        assert_eq!(combine(&blocks_for(&reversed)), single);

        assert_eq!(
            single[&1],
            FilestoreUsage {
                entity_count: 4,
                used_bytes: 370
            }
        );
        assert_eq!(
            single[&2],
            FilestoreUsage {
                entity_count: 2,
                used_bytes: 105
            }
        );
        // a tenant with zero bytes is still an entity
        assert_eq!(
            single[&3],
            FilestoreUsage {
                entity_count: 1,
                used_bytes: 0
            }
        );
    }

    #[test]
    fn test_empty_blocks_are_ignored() {
        let mut blocks = HashMap::new();
        blocks.insert(UsageBlockKey::new(&Shard::new(1, "oxdb_1"), 4), UsageBlock::default());
        assert!(combine(&blocks).is_empty());
    }

    #[test]
    fn test_entity_count_view() {
        let tenants = HashMap::from([(1, 3u64), (2, 1u64)]);
        let accounts = HashMap::from([(2, 4u64), (3, 2u64)]);
        let view = entity_count_view(&tenants, &accounts);

        assert_eq!(view[&1], EntityCounts { tenants: 3, accounts: 0 });
        assert_eq!(view[&2].total(), 5);
        assert_eq!(view[&3].of_kind(EntityKind::Account), 2);
        assert_eq!(view[&3].of_kind(EntityKind::Tenant), 0);
    }
}
