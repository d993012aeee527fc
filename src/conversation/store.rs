//! Persisted conversation state (redb), plus an in-memory store.

use crate::HistoryEntry;
use crate::error::StoreError;

use redb::{Database, ReadableTable as _, TableDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversation_history");

/// Read/persist access to whole conversation histories.
///
/// Callers serialize access per conversation id; implementations need not.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn read(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn persist(
        &self,
        conversation_id: &str,
        history: &[HistoryEntry],
    ) -> Result<(), StoreError>;
}

fn redb_error(error: impl Into<redb::Error>) -> StoreError {
    StoreError::Redb(error.into())
}

/// History stored as JSON blobs keyed by conversation id.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStateStore").finish_non_exhaustive()
    }
}

impl RedbStateStore {
    /// Open (or create) the database at `path`.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| redb_error(redb::Error::Io(error)))?;
        }
        let db = Database::create(path).map_err(redb_error)?;

        // Create the table up front so reads never see a missing table.
        let txn = db.begin_write().map_err(redb_error)?;
        txn.open_table(HISTORY_TABLE).map_err(redb_error)?;
        txn.commit().map_err(redb_error)?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl StateStore for RedbStateStore {
    async fn read(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let db = self.db.clone();
        let key = conversation_id.to_string();

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(redb_error)?;
            let table = txn.open_table(HISTORY_TABLE).map_err(redb_error)?;
            match table.get(key.as_str()).map_err(redb_error)? {
                Some(value) => Ok(serde_json::from_slice(value.value())?),
                None => Ok(Vec::new()),
            }
        })
        .await
        .map_err(|error| StoreError::Join(error.to_string()))?
    }

    async fn persist(
        &self,
        conversation_id: &str,
        history: &[HistoryEntry],
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let key = conversation_id.to_string();
        let value = serde_json::to_vec(history)?;

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(redb_error)?;
            {
                let mut table = txn.open_table(HISTORY_TABLE).map_err(redb_error)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(redb_error)?;
            }
            txn.commit().map_err(redb_error)?;
            Ok(())
        })
        .await
        .map_err(|error| StoreError::Join(error.to_string()))?
    }
}

/// Volatile store, used when no data directory is wanted and in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    histories: tokio::sync::RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .histories
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist(
        &self,
        conversation_id: &str,
        history: &[HistoryEntry],
    ) -> Result<(), StoreError> {
        self.histories
            .write()
            .await
            .insert(conversation_id.to_string(), history.to_vec());
        Ok(())
    }
}
