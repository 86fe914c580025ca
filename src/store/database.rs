//! redb-backed document store
//!
//! Keeps every document in one table keyed by `collection/id` with the JSON
//! body as the value. redb runs one write transaction at a time, which gives
//! the checkout core serializable read-modify-write.

use async_trait::async_trait;
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{
    field_matches, merge_fields, DocPath, DocumentChange, DocumentStore, StoreError, TxnContext,
    TxnFn,
};

/// Key: `collection/id`
/// Value: serialized JSON document
const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Database wrapper for document storage
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    tx: broadcast::Sender<DocumentChange>,
}

impl RedbStore {
    /// Create a new database instance or open an existing one
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }

        let db = Database::create(path).map_err(backend)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _table = write_txn.open_table(DOCUMENTS_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        tracing::info!("Database initialized with documents table");

        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            tx,
        })
    }

    fn notify(&self, changes: Vec<DocumentChange>) {
        for change in changes {
            let _ = self.tx.send(change);
        }
    }

    fn write<F>(&self, op: F) -> Result<(Value, Vec<DocumentChange>), StoreError>
    where
        F: FnOnce(&mut dyn TxnContext) -> Result<Value, StoreError>,
    {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let result = {
            let table = write_txn.open_table(DOCUMENTS_TABLE).map_err(backend)?;
            let mut ctx = RedbTxn {
                table,
                changes: Vec::new(),
            };
            op(&mut ctx).map(|out| (out, ctx.changes))
        };
        match result {
            Ok(done) => {
                write_txn.commit().map_err(backend)?;
                Ok(done)
            }
            Err(e) => {
                write_txn.abort().map_err(backend)?;
                Err(e)
            }
        }
    }
}

struct RedbTxn<'txn> {
    table: Table<'txn, &'static str, &'static [u8]>,
    changes: Vec<DocumentChange>,
}

impl TxnContext for RedbTxn<'_> {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        let key = path.key();
        match self.table.get(key.as_str()).map_err(backend)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        let key = path.key();
        let bytes = serde_json::to_vec(&data)?;
        self.table
            .insert(key.as_str(), bytes.as_slice())
            .map_err(backend)?;
        self.changes.push(DocumentChange {
            path: path.clone(),
            data,
        });
        Ok(())
    }

    fn update(&mut self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        let mut current = self
            .get(path)?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        merge_fields(path, &mut current, fields)?;
        self.set(path, current)
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(DOCUMENTS_TABLE).map_err(backend)?;

        let key = path.key();
        let result = table.get(key.as_str()).map_err(backend)?;
        match result {
            Some(curr) => Ok(Some(serde_json::from_slice(curr.value())?)),
            None => Ok(None),
        }
    }

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        let (_, changes) = self.write(|txn| {
            txn.set(path, data)?;
            Ok(Value::Null)
        })?;
        tracing::debug!(path = %path, "Stored document");
        self.notify(changes);
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        let (_, changes) = self.write(|txn| {
            txn.update(path, fields)?;
            Ok(Value::Null)
        })?;
        self.notify(changes);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(DOCUMENTS_TABLE).map_err(backend)?;

        let prefix = format!("{collection}/");
        let mut hits = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(backend)? {
            let (key, raw) = entry.map_err(backend)?;
            let Some(id) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            // Skip documents of nested collections below this one
            if id.contains('/') {
                continue;
            }
            let doc: Value = serde_json::from_slice(raw.value())?;
            if field_matches(&doc, field, value) {
                hits.push((id.to_string(), doc));
            }
        }
        Ok(hits)
    }

    async fn transaction(&self, op: &mut TxnFn<'_>) -> Result<Value, StoreError> {
        let (out, changes) = self.write(|txn| op(txn))?;
        self.notify(changes);
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.tx.subscribe()
    }
}
