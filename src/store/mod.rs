// Document store abstraction consumed by the checkout core

pub mod database;
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

pub use self::database::RedbStore;
pub use self::memory::MemoryStore;

/// Location of a single document: `collection/id`.
///
/// Nested collections are expressed in the collection name, e.g.
/// `users/u1/voucherUsage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocPath),
    #[error("document is not an object: {0}")]
    NotAnObject(DocPath),
    #[error("transaction aborted: {0}")]
    Aborted(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A committed write, broadcast to subscribers after the commit.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub path: DocPath,
    pub data: Value,
}

/// View over the store inside a transaction. Reads observe earlier writes
/// of the same transaction; nothing is visible to others until commit.
pub trait TxnContext {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, StoreError>;
    fn set(&mut self, path: &DocPath, data: Value) -> Result<(), StoreError>;
    fn update(&mut self, path: &DocPath, fields: Value) -> Result<(), StoreError>;
}

/// Transaction body. It may run more than once on backends that retry on
/// conflict, so it must only touch the store through the context.
pub type TxnFn<'a> = dyn FnMut(&mut dyn TxnContext) -> Result<Value, StoreError> + Send + 'a;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError>;

    /// Merge top-level fields into an existing document.
    async fn update(&self, path: &DocPath, fields: Value) -> Result<(), StoreError>;

    /// Documents of `collection` whose top-level `field` equals `value`.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Run `op` atomically. An `Err` from `op` discards every write.
    async fn transaction(&self, op: &mut TxnFn<'_>) -> Result<Value, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;
}

/// Shallow merge of `fields` into `target`; both must be JSON objects.
pub fn merge_fields(path: &DocPath, target: &mut Value, fields: Value) -> Result<(), StoreError> {
    let Value::Object(fields) = fields else {
        return Err(StoreError::NotAnObject(path.clone()));
    };
    let Some(target) = target.as_object_mut() else {
        return Err(StoreError::NotAnObject(path.clone()));
    };
    for (k, v) in fields {
        target.insert(k, v);
    }
    Ok(())
}

pub(crate) fn field_matches(doc: &Value, field: &str, value: &Value) -> bool {
    doc.get(field).is_some_and(|v| v == value)
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Typed read of a single document.
pub async fn get_as<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    path: &DocPath,
) -> Result<Option<T>, StoreError> {
    store.get(path).await?.map(decode).transpose()
}

/// Typed read inside a transaction.
pub fn txn_get_as<T: DeserializeOwned>(
    txn: &mut dyn TxnContext,
    path: &DocPath,
) -> Result<Option<T>, StoreError> {
    txn.get(path)?.map(decode).transpose()
}
