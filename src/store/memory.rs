// In-memory document store

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{
    field_matches, merge_fields, DocPath, DocumentChange, DocumentStore, StoreError, TxnContext,
    TxnFn,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Document store held in process memory.
///
/// Transactions run under the writer lock, so they are serializable and
/// never need a retry.
pub struct MemoryStore {
    docs: RwLock<BTreeMap<DocPath, Value>>,
    tx: broadcast::Sender<DocumentChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            docs: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    fn notify(&self, path: DocPath, data: Value) {
        // No subscribers is not an error
        let _ = self.tx.send(DocumentChange { path, data });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct StagedTxn<'a> {
    base: &'a BTreeMap<DocPath, Value>,
    writes: BTreeMap<DocPath, Value>,
}

impl TxnContext for StagedTxn<'_> {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        Ok(self
            .writes
            .get(path)
            .or_else(|| self.base.get(path))
            .cloned())
    }

    fn set(&mut self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        self.writes.insert(path.clone(), data);
        Ok(())
    }

    fn update(&mut self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        let mut current = self
            .get(path)?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        merge_fields(path, &mut current, fields)?;
        self.writes.insert(path.clone(), current);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.read().await.get(path).cloned())
    }

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        self.docs.write().await.insert(path.clone(), data.clone());
        self.notify(path.clone(), data);
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        let merged = {
            let mut docs = self.docs.write().await;
            let doc = docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.clone()))?;
            merge_fields(path, doc, fields)?;
            doc.clone()
        };
        self.notify(path.clone(), merged);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(path, doc)| path.collection == collection && field_matches(doc, field, value))
            .map(|(path, doc)| (path.id.clone(), doc.clone()))
            .collect())
    }

    async fn transaction(&self, op: &mut TxnFn<'_>) -> Result<Value, StoreError> {
        let mut docs = self.docs.write().await;
        let (out, writes) = {
            let mut staged = StagedTxn {
                base: &docs,
                writes: BTreeMap::new(),
            };
            let out = op(&mut staged)?;
            (out, staged.writes)
        };

        debug!(writes = writes.len(), "Committing in-memory transaction");
        for (path, data) in writes {
            docs.insert(path.clone(), data.clone());
            self.notify(path, data);
        }
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.tx.subscribe()
    }
}
