//! Document store collaborator

use std::collections::HashMap;
use std::ops::RangeInclusive;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::id::ObjectId;

/// A stored record; `_id` holds its primary key
pub type Document = serde_json::Map<String, Value>;

/// Field holding a record's primary key
pub const ID_FIELD: &str = "_id";

/// Errors raised by a document store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data does not have the expected shape
    #[error("corrupt record in {collection}: {reason}")]
    Corrupt {
        /// Collection name
        collection: String,
        /// What was wrong
        reason: String,
    },
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

/// Inclusive range of status codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRange(pub RangeInclusive<i32>);

impl CodeRange {
    #[must_use]
    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }
}

impl From<i32> for CodeRange {
    fn from(code: i32) -> Self {
        Self(code..=code)
    }
}

impl From<RangeInclusive<i32>> for CodeRange {
    fn from(range: RangeInclusive<i32>) -> Self {
        Self(range)
    }
}

/// Persistence backend used by the orchestration layers
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return the record matching every `filter` field, inserting
    /// `filter` merged with `fields` when none exists
    ///
    /// An existing record is returned unchanged.
    async fn create_or_get(
        &self,
        collection: &str,
        filter: Document,
        fields: Document,
    ) -> Result<Document, StoreError>;

    /// Overwrite the given fields of one record, reporting whether it exists
    async fn update_fields(
        &self,
        collection: &str,
        id: &ObjectId,
        patch: Document,
    ) -> Result<bool, StoreError>;

    /// Records whose `code` falls in `codes`
    async fn find_by_code(
        &self,
        collection: &str,
        codes: CodeRange,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_by_id(
        &self,
        collection: &str,
        id: &ObjectId,
    ) -> Result<Option<Document>, StoreError>;
}

/// Primary key of a stored record
///
/// # Errors
/// Returns `StoreError::Corrupt` if `_id` is missing or malformed.
pub fn document_id(collection: &str, doc: &Document) -> Result<ObjectId, StoreError> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .and_then(|id| ObjectId::parse(id).ok())
        .ok_or_else(|| StoreError::Corrupt {
            collection: collection.to_string(),
            reason: "missing or malformed _id".to_string(),
        })
}

/// In-process store backed by vectors of documents
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `collection`
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_or_get(
        &self,
        collection: &str,
        filter: Document,
        fields: Document,
    ) -> Result<Document, StoreError> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = records.iter().find(|doc| matches(doc, &filter)) {
            return Ok(existing.clone());
        }

        let mut doc = filter;
        doc.extend(fields);
        doc.insert(
            ID_FIELD.to_string(),
            Value::String(ObjectId::new().to_string()),
        );
        records.push(doc.clone());
        Ok(doc)
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &ObjectId,
        patch: Document,
    ) -> Result<bool, StoreError> {
        let mut collections = self.collections.write().await;
        let key = Value::String(id.to_string());

        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|doc| doc.get(ID_FIELD) == Some(&key)))
        else {
            return Ok(false);
        };

        doc.extend(patch);
        Ok(true)
    }

    async fn find_by_code(
        &self,
        collection: &str,
        codes: CodeRange,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|doc| {
                        doc.get("code")
                            .and_then(Value::as_i64)
                            .and_then(|code| i32::try_from(code).ok())
                            .is_some_and(|code| codes.contains(code))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_id(
        &self,
        collection: &str,
        id: &ObjectId,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        let key = Value::String(id.to_string());
        Ok(collections.get(collection).and_then(|records| {
            records
                .iter()
                .find(|doc| doc.get(ID_FIELD) == Some(&key))
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_create_or_get_is_idempotent() {
        let store = MemoryStore::new();
        let filter = doc(json!({"host": "a", "application": {"cmd": "sync"}}));

        let first = store
            .create_or_get("task", filter.clone(), doc(json!({"code": 20})))
            .await
            .unwrap();
        let second = store
            .create_or_get("task", filter, doc(json!({"code": 99})))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second["code"], json!(20));
        assert_eq!(store.count("task").await, 1);
    }

    #[tokio::test]
    async fn test_update_and_find() {
        let store = MemoryStore::new();
        let created = store
            .create_or_get("transfer", doc(json!({"n": 1})), doc(json!({"code": 10})))
            .await
            .unwrap();
        let id = document_id("transfer", &created).unwrap();

        assert!(
            store
                .update_fields("transfer", &id, doc(json!({"code": 12})))
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_fields("transfer", &ObjectId::new(), doc(json!({"code": 12})))
                .await
                .unwrap()
        );

        assert_eq!(store.find_by_code("transfer", 12.into()).await.unwrap().len(), 1);
        assert!(store.find_by_code("transfer", 10.into()).await.unwrap().is_empty());
        assert_eq!(
            store
                .find_by_code("transfer", (10..=13).into())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.find_by_id("transfer", &id).await.unwrap().is_some());
    }
}
