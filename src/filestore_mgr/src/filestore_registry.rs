use crate::control_db::{ControlDB, FilestoreRow};
use filestore_lib::{
    bytes_to_mb, capacity_mb_to_bytes, Filestore, FilestoreId, FilestoreUpdate, FsError, FsResult,
};
use log::{info, warn};
use std::sync::Arc;

/// Turn a user pattern (`*` any run, `?` one char) into a SQL `LIKE` pattern.
pub fn like_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return "%".to_string();
    }

    let mut result = String::with_capacity(pattern.len() + 2);
    for c in pattern.chars() {
        match c {
            '*' => result.push('%'),
            '?' => result.push('_'),
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            }
            _ => result.push(c),
        }
    }
    result
}

impl From<&FilestoreRow> for Filestore {
    fn from(row: &FilestoreRow) -> Self {
        Filestore {
            id: row.id,
            uri: row.uri.clone(),
            size_mb: bytes_to_mb(row.capacity_bytes),
            max_entities: row.max_entities,
            ..Default::default()
        }
    }
}

fn check_uri(uri: &str) -> FsResult<()> {
    if uri.trim().is_empty() {
        return Err(FsError::InvalidParam("filestore uri is empty".to_string()));
    }
    Ok(())
}

fn check_max_entities(max_entities: i64) -> FsResult<()> {
    if max_entities < 0 {
        return Err(FsError::InvalidParam(format!(
            "max entities must not be negative: {}",
            max_entities
        )));
    }
    Ok(())
}

/// Master record of filestores. Sizes cross this API in megabytes and are
/// stored in bytes.
pub struct FilestoreRegistry {
    control: Arc<ControlDB>,
}

impl FilestoreRegistry {
    pub fn new(control: Arc<ControlDB>) -> Self {
        Self { control }
    }

    pub fn get(&self, id: FilestoreId) -> FsResult<Filestore> {
        let row = self.control.get_filestore(id)?;
        Ok(Filestore::from(&row))
    }

    pub fn list(&self, pattern: &str) -> FsResult<Vec<Filestore>> {
        let rows = self.control.list_filestores(&like_pattern(pattern))?;
        Ok(rows.iter().map(Filestore::from).collect())
    }

    pub fn register(&self, filestore: &Filestore) -> FsResult<FilestoreId> {
        let uri = filestore.uri.trim();
        check_uri(uri)?;
        check_max_entities(filestore.max_entities)?;
        let capacity_bytes = capacity_mb_to_bytes(filestore.size_mb)?;

        let id = self.control.with_structure_lock(|tx| {
            if ControlDB::uri_in_use(tx, uri, None)? {
                warn!("FilestoreRegistry: uri {} already registered", uri);
                return Err(FsError::AlreadyExists(format!(
                    "filestore uri {} already registered",
                    uri
                )));
            }
            ControlDB::insert_filestore(tx, uri, capacity_bytes, filestore.max_entities)
        })?;

        info!(
            "FilestoreRegistry: registered filestore {} uri {} size {}MB max entities {}",
            id, uri, filestore.size_mb, filestore.max_entities
        );
        Ok(id)
    }

    pub fn update(&self, update: &FilestoreUpdate) -> FsResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let uri = update.uri.as_deref().map(str::trim);
        if let Some(uri) = uri {
            check_uri(uri)?;
        }
        if let Some(max_entities) = update.max_entities {
            check_max_entities(max_entities)?;
        }
        let capacity_bytes = update.size_mb.map(capacity_mb_to_bytes).transpose()?;

        self.control.with_structure_lock(|tx| {
            let mut row = ControlDB::load_filestore_in_tx(tx, update.id)?;
            if let Some(uri) = uri {
                if ControlDB::uri_in_use(tx, uri, Some(update.id))? {
                    return Err(FsError::AlreadyExists(format!(
                        "filestore uri {} already registered",
                        uri
                    )));
                }
                row.uri = uri.to_string();
            }
            if let Some(capacity_bytes) = capacity_bytes {
                row.capacity_bytes = capacity_bytes;
            }
            if let Some(max_entities) = update.max_entities {
                row.max_entities = max_entities;
            }
            ControlDB::update_filestore(tx, &row)
        })?;

        info!("FilestoreRegistry: updated filestore {}", update.id);
        Ok(())
    }

    /// Remove a filestore no tenant references.
    ///
    /// Account assignments live on the shards and are checked by
    /// `FilestoreMgr::deregister` before it gets here.
    pub fn deregister(&self, id: FilestoreId) -> FsResult<()> {
        self.control.with_structure_lock(|tx| {
            ControlDB::load_filestore_in_tx(tx, id)?;
            let tenants = ControlDB::tenants_on_filestore(tx, id)?;
            if tenants > 0 {
                warn!(
                    "FilestoreRegistry: filestore {} still used by {} tenants",
                    id, tenants
                );
                return Err(FsError::InUse(format!(
                    "filestore {} still used by {} tenants",
                    id, tenants
                )));
            }
            ControlDB::delete_filestore(tx, id)
        })?;

        info!("FilestoreRegistry: deregistered filestore {}", id);
        Ok(())
    }
}
