use crate::control_db::{ControlDB, FilestoreRow};
use crate::shard_catalog::ShardCatalog;
use crate::usage_aggregator::{combine, FilestoreUsage};
use crate::usage_fanout::UsageFanOut;
use filestore_lib::{
    bytes_to_mb, EntityKind, Filestore, FilestoreConfig, FilestoreId, FsError, FsResult, Shard,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// How the allocator decides how much of a filestore is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// `entity count × average entity size`, no shard is read.
    #[default]
    Estimated,
    /// Real used bytes from a full usage aggregation.
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub kind: EntityKind,
    pub mode: AllocationMode,
    /// Filestore to reuse when it still has room.
    pub hint: Option<FilestoreId>,
}

impl AllocationRequest {
    pub fn tenant() -> Self {
        Self {
            kind: EntityKind::Tenant,
            mode: AllocationMode::default(),
            hint: None,
        }
    }

    pub fn account() -> Self {
        Self {
            kind: EntityKind::Account,
            ..Self::tenant()
        }
    }

    pub fn with_mode(mut self, mode: AllocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_hint(mut self, hint: FilestoreId) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// An enabled filestore and the number of entities of the requested kind on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationCandidate {
    pub row: FilestoreRow,
    pub entity_count: u64,
}

impl AllocationCandidate {
    fn is_full(&self) -> bool {
        self.entity_count.saturating_add(1) > u64::try_from(self.row.max_entities).unwrap_or(0)
    }

    fn to_filestore(&self, used_bytes: u64, reserved_bytes: u64) -> Filestore {
        Filestore {
            id: self.row.id,
            uri: self.row.uri.clone(),
            size_mb: bytes_to_mb(self.row.capacity_bytes),
            max_entities: self.row.max_entities,
            entity_count: self.entity_count,
            used_mb: bytes_to_mb(used_bytes),
            reserved_mb: bytes_to_mb(reserved_bytes),
        }
    }
}

/// Least loaded first, ties broken by id.
pub fn sort_candidates(candidates: &mut [AllocationCandidate]) {
    candidates.sort_by(|a, b| {
        a.entity_count
            .cmp(&b.entity_count)
            .then(a.row.id.cmp(&b.row.id))
    });
}

pub fn fits(reserved_bytes: u64, heuristic_bytes: u64, capacity_bytes: u64) -> bool {
    reserved_bytes
        .checked_add(heuristic_bytes)
        .map_or(false, |need| need <= capacity_bytes)
}

/// First candidate, in order, that is under its entity cap and has room for
/// one more entity of `heuristic_bytes`. Returns it with its reserved bytes.
pub fn select_candidate<'a>(
    candidates: &'a [AllocationCandidate],
    heuristic_bytes: u64,
    reserved_of: impl Fn(&AllocationCandidate) -> u64,
) -> Option<(&'a AllocationCandidate, u64)> {
    for candidate in candidates {
        if candidate.is_full() {
            debug!(
                "Allocator: filestore {} is full: {} of {} entities",
                candidate.row.id, candidate.entity_count, candidate.row.max_entities
            );
            continue;
        }
        let reserved = reserved_of(candidate);
        if fits(reserved, heuristic_bytes, candidate.row.capacity_bytes) {
            return Some((candidate, reserved));
        }
        debug!(
            "Allocator: filestore {} has no room: reserved {} + {} > {}",
            candidate.row.id, reserved, heuristic_bytes, candidate.row.capacity_bytes
        );
    }
    None
}

/// Picks the filestore a new tenant or account should live on. Never writes.
pub struct FilestoreAllocator {
    control: Arc<ControlDB>,
    catalog: Arc<ShardCatalog>,
    fanout: Arc<UsageFanOut>,
    config: FilestoreConfig,
}

impl FilestoreAllocator {
    pub fn new(
        control: Arc<ControlDB>,
        catalog: Arc<ShardCatalog>,
        fanout: Arc<UsageFanOut>,
        config: FilestoreConfig,
    ) -> Self {
        Self {
            control,
            catalog,
            fanout,
            config,
        }
    }

    async fn load_candidates(&self, kind: EntityKind) -> FsResult<Vec<AllocationCandidate>> {
        let mut candidates: Vec<AllocationCandidate> = match kind {
            EntityKind::Tenant => self
                .control
                .tenant_candidates()?
                .into_iter()
                .map(|c| AllocationCandidate {
                    row: c.row,
                    entity_count: c.tenant_count,
                })
                .collect(),
            EntityKind::Account => {
                let rows = self.control.list_filestores("%")?;
                let shards: Vec<Shard> = self.catalog.list_shards()?.into_iter().collect();
                let counts = self.fanout.count_account_assignments(&shards).await?;
                rows.into_iter()
                    .filter(|row| row.max_entities > 0)
                    .map(|row| {
                        let entity_count = counts.get(&row.id).copied().unwrap_or(0);
                        AllocationCandidate { row, entity_count }
                    })
                    .collect()
            }
        };
        sort_candidates(&mut candidates);
        Ok(candidates)
    }

    async fn exact_usage(&self) -> FsResult<HashMap<FilestoreId, FilestoreUsage>> {
        let shards: Vec<Shard> = self.catalog.list_shards()?.into_iter().collect();
        let tenant_filestores = Arc::new(self.catalog.tenant_filestores()?);
        let blocks = self
            .fanout
            .aggregate_usage(&shards, tenant_filestores)
            .await?;
        Ok(combine(&blocks))
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> FsResult<Filestore> {
        let heuristic = self.config.heuristic_bytes(request.kind);
        let candidates = self.load_candidates(request.kind).await?;
        let usage = match request.mode {
            AllocationMode::Estimated => HashMap::new(),
            AllocationMode::Exact => self.exact_usage().await?,
        };
        let used_of = |candidate: &AllocationCandidate| {
            usage
                .get(&candidate.row.id)
                .map(|u| u.used_bytes)
                .unwrap_or(0)
        };
        let reserved_of = |candidate: &AllocationCandidate| match request.mode {
            AllocationMode::Estimated => candidate.entity_count.saturating_mul(heuristic),
            AllocationMode::Exact => used_of(candidate),
        };

        if let Some(hint) = request.hint {
            match candidates.iter().find(|c| c.row.id == hint) {
                Some(candidate) => {
                    let reserved = reserved_of(candidate);
                    if candidate.is_full() {
                        debug!(
                            "Allocator: hinted filestore {} is at its entity cap, fall back to scan",
                            hint
                        );
                    } else if fits(reserved, heuristic, candidate.row.capacity_bytes) {
                        info!(
                            "Allocator: reuse hinted filestore {} for {}",
                            hint, request.kind
                        );
                        return Ok(candidate.to_filestore(used_of(candidate), reserved));
                    } else {
                        debug!(
                            "Allocator: hinted filestore {} has no room, fall back to scan",
                            hint
                        );
                    }
                }
                None => debug!(
                    "Allocator: hinted filestore {} unknown or disabled, fall back to scan",
                    hint
                ),
            }
        }

        match select_candidate(&candidates, heuristic, reserved_of) {
            Some((candidate, reserved)) => {
                info!(
                    "Allocator: selected filestore {} for {} ({:?}), {} entities, reserved {} bytes",
                    candidate.row.id, request.kind, request.mode, candidate.entity_count, reserved
                );
                Ok(candidate.to_filestore(used_of(candidate), reserved))
            }
            None => {
                warn!(
                    "Allocator: no filestore can take a new {} among {} candidates",
                    request.kind,
                    candidates.len()
                );
                Err(FsError::NoSuitableFilestore(format!(
                    "no filestore has room for a new {}",
                    request.kind
                )))
            }
        }
    }
}
