//! Persistence of transfers and tasks

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetsync_api::Application;
use fleetsync_api::requests::{HostEntry, TransferPostRequest};
use fleetsync_api::responses::{HostResult, RecordSummary, TraceEntry, TransferView};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::id::ObjectId;
use crate::store::{CodeRange, Document, DocumentStore, ID_FIELD, document_id};

const TRANSFERS: &str = "transfers";
const TASKS: &str = "tasks";

/// Converts a `json!` object literal into a document
pub(crate) fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Document persistence behind the tunnel layer
pub struct TransferModule {
    store: Arc<dyn DocumentStore>,
}

impl TransferModule {
    /// Service table name
    pub const NAME: &'static str = "tunnel";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist or fetch the transfer record for `request`
    pub async fn create_transfer(
        &self,
        request: &TransferPostRequest,
        code: i32,
        message: &str,
    ) -> Result<ObjectId, CoreError> {
        let now = Utc::now();
        let filter = document(json!({
            "transaction_id": request.transaction_id,
            "hosts": request.hosts,
        }));
        let fields = document(json!({
            "retry": request.retry,
            "timeout": request.timeout,
            "application": request.application,
            "code": code,
            "message": message,
            "create_time": now,
            "last_time": now,
            "results": [],
        }));

        let doc = self.store.create_or_get(TRANSFERS, filter, fields).await?;
        Ok(document_id(TRANSFERS, &doc)?)
    }

    /// Record a transfer's code, and its aggregate results once known
    pub async fn update_transfer(
        &self,
        id: &ObjectId,
        code: i32,
        message: &str,
        results: Option<&[HostResult]>,
    ) -> Result<bool, CoreError> {
        let mut patch = document(json!({
            "code": code,
            "message": message,
            "last_time": Utc::now(),
        }));
        if let Some(results) = results {
            patch.insert("results".to_string(), json!(results));
        }
        Ok(self.store.update_fields(TRANSFERS, id, patch).await?)
    }

    /// Persist or fetch the task record of `host` inside a transfer
    pub async fn create_task(
        &self,
        transfer_id: &ObjectId,
        host: &HostEntry,
        application: &Application,
        retry: u32,
        timeout: u64,
        code: i32,
    ) -> Result<ObjectId, CoreError> {
        let now = Utc::now();
        let filter = document(json!({
            "transfer_id": transfer_id,
            "host": host.host,
            "application": application,
        }));
        let fields = document(json!({
            "hostname": host.hostname,
            "retry": retry,
            "timeout": timeout,
            "code": code,
            "message": "",
            "timestamp": now,
            "duration": 0,
            "trace": [],
        }));

        let doc = self.store.create_or_get(TASKS, filter, fields).await?;
        Ok(document_id(TASKS, &doc)?)
    }

    /// Record a task's code together with its trace
    pub async fn update_task(
        &self,
        id: &ObjectId,
        code: i32,
        message: &str,
        timestamp: DateTime<Utc>,
        duration: u64,
        trace: &[TraceEntry],
    ) -> Result<bool, CoreError> {
        let patch = document(json!({
            "code": code,
            "message": message,
            "timestamp": timestamp,
            "duration": duration,
            "trace": trace,
        }));
        Ok(self.store.update_fields(TASKS, id, patch).await?)
    }

    /// Stored transfer as a view, for transfers no longer in memory
    pub async fn load_transfer(&self, id: &ObjectId) -> Result<Option<TransferView>, CoreError> {
        let Some(doc) = self.store.find_by_id(TRANSFERS, id).await? else {
            return Ok(None);
        };

        let field = |name: &str| doc.get(name).cloned().unwrap_or(Value::Null);
        Ok(Some(TransferView {
            transfer_id: id.to_string(),
            transaction_id: field("transaction_id").as_str().unwrap_or_default().to_string(),
            code: code_of(&doc),
            message: field("message").as_str().unwrap_or_default().to_string(),
            create_time: serde_json::from_value(field("create_time")).ok(),
            last_time: serde_json::from_value(field("last_time")).ok(),
            hosts: serde_json::from_value(field("hosts")).unwrap_or_default(),
            results: serde_json::from_value(field("results")).unwrap_or_default(),
        }))
    }

    /// Stored transfers whose code falls in `codes`
    pub async fn find_transfers(&self, codes: CodeRange) -> Result<Vec<RecordSummary>, CoreError> {
        let docs = self.store.find_by_code(TRANSFERS, codes).await?;
        Ok(docs.iter().map(summary).collect())
    }
}

pub(crate) fn code_of(doc: &Document) -> i32 {
    doc.get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(-1)
}

pub(crate) fn summary(doc: &Document) -> RecordSummary {
    RecordSummary {
        id: doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        code: code_of(doc),
        message: doc
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        last_time: doc
            .get("last_time")
            .and_then(|t| serde_json::from_value(t.clone()).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request() -> TransferPostRequest {
        TransferPostRequest {
            transaction_id: ObjectId::new().to_string(),
            hosts: vec![HostEntry {
                host: "0000000a-1".to_string(),
                hostname: "edge-01".to_string(),
                context: Application::new(),
            }],
            retry: 3,
            timeout: 5,
            application: Application::new(),
        }
    }

    #[tokio::test]
    async fn test_transfer_record_is_reused() {
        let module = TransferModule::new(Arc::new(MemoryStore::new()));
        let request = request();

        let first = module.create_transfer(&request, 10, "TransferCreated").await.unwrap();
        let second = module.create_transfer(&request, 10, "TransferCreated").await.unwrap();
        assert_eq!(first, second);

        let results = vec![HostResult {
            host: "0000000a-1".to_string(),
            code: 200,
            message: "ok".to_string(),
            trace: Vec::new(),
        }];
        assert!(
            module
                .update_transfer(&first, 12, "TransferEnded", Some(&results))
                .await
                .unwrap()
        );

        let view = module.load_transfer(&first).await.unwrap().unwrap();
        assert_eq!(view.code, 12);
        assert_eq!(view.results, results);
        assert_eq!(view.hosts.len(), 1);

        let ended = module.find_transfers(CodeRange::from(12)).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].id, first.to_string());
    }
}
