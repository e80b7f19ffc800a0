//! Persistence of transactions

use std::sync::Arc;

use chrono::Utc;
use fleetsync_api::responses::{RecordSummary, TransactionView, TransferView};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::id::ObjectId;
use crate::store::{CodeRange, DocumentStore, document_id};
use crate::sync::transaction::TransactionWork;
use crate::tunnel::module::{code_of, document, summary};

const TRANSACTIONS: &str = "transactions";

/// Document persistence behind the sync layer
pub struct TransactionModule {
    store: Arc<dyn DocumentStore>,
}

impl TransactionModule {
    /// Service table name
    pub const NAME: &'static str = "sync";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist or fetch the active transaction record for `work`
    pub async fn create_transaction(
        &self,
        work: &TransactionWork,
        code: i32,
        message: &str,
    ) -> Result<ObjectId, CoreError> {
        let now = Utc::now();
        let filter = document(json!({
            "dst": work.dst,
            "application": work.application,
            "retry": work.retry,
            "timeout": work.timeout,
            "active": true,
        }));
        let fields = document(json!({
            "code": code,
            "message": message,
            "create_time": now,
            "last_time": now,
            "transfers": [],
        }));

        let doc = self.store.create_or_get(TRANSACTIONS, filter, fields).await?;
        Ok(document_id(TRANSACTIONS, &doc)?)
    }

    /// Overwrite the stored bucket list
    pub async fn update_transfers(&self, id: &ObjectId, transfers: Value) -> Result<bool, CoreError> {
        let patch = document(json!({
            "transfers": transfers,
            "last_time": Utc::now(),
        }));
        Ok(self.store.update_fields(TRANSACTIONS, id, patch).await?)
    }

    pub async fn update_transaction(
        &self,
        id: &ObjectId,
        code: i32,
        message: &str,
    ) -> Result<bool, CoreError> {
        let patch = document(json!({
            "code": code,
            "message": message,
            "last_time": Utc::now(),
        }));
        Ok(self.store.update_fields(TRANSACTIONS, id, patch).await?)
    }

    /// Mark the record inactive so an identical request starts a new transaction
    pub async fn deactivate(&self, id: &ObjectId) -> Result<bool, CoreError> {
        let patch = document(json!({ "active": false }));
        Ok(self.store.update_fields(TRANSACTIONS, id, patch).await?)
    }

    /// Stored transaction as a view, for transactions no longer in memory
    pub async fn load_transaction(
        &self,
        id: &ObjectId,
    ) -> Result<Option<TransactionView>, CoreError> {
        let Some(doc) = self.store.find_by_id(TRANSACTIONS, id).await? else {
            return Ok(None);
        };

        let field = |name: &str| doc.get(name).cloned().unwrap_or(Value::Null);
        let transfers = field("transfers")
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|record| TransferView {
                        transfer_id: record
                            .get("transfer_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        transaction_id: id.to_string(),
                        code: code_of(record),
                        message: record
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        create_time: None,
                        last_time: None,
                        hosts: record
                            .get("hosts")
                            .and_then(|h| serde_json::from_value(h.clone()).ok())
                            .unwrap_or_default(),
                        results: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let now = Utc::now();
        Ok(Some(TransactionView {
            transaction_id: id.to_string(),
            code: code_of(&doc),
            message: field("message").as_str().unwrap_or_default().to_string(),
            create_time: serde_json::from_value(field("create_time")).unwrap_or(now),
            last_time: serde_json::from_value(field("last_time")).unwrap_or(now),
            application: field("application").as_object().cloned().unwrap_or_default(),
            transfers,
        }))
    }

    /// Stored transactions whose code falls in `codes`
    pub async fn find_transactions(
        &self,
        codes: CodeRange,
    ) -> Result<Vec<RecordSummary>, CoreError> {
        let docs = self.store.find_by_code(TRANSACTIONS, codes).await?;
        Ok(docs.iter().map(summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use fleetsync_api::requests::{Dst, DstEntry};

    use super::*;
    use crate::store::MemoryStore;

    fn work() -> TransactionWork {
        TransactionWork {
            dst: Dst::Hosts(vec![DstEntry::Host("edge-01".to_string())]),
            retry: 3,
            timeout: 5,
            application: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_deactivated_record_is_not_reused() {
        let module = TransactionModule::new(Arc::new(MemoryStore::new()));

        let first = module.create_transaction(&work(), 0, "TransactionCreated").await.unwrap();
        assert_eq!(
            module.create_transaction(&work(), 0, "TransactionCreated").await.unwrap(),
            first
        );

        module.update_transaction(&first, 3, "TransactionFinished").await.unwrap();
        module.deactivate(&first).await.unwrap();
        let second = module.create_transaction(&work(), 0, "TransactionCreated").await.unwrap();
        assert_ne!(first, second);

        let finished = module.find_transactions(CodeRange::from(3)).await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, first.to_string());

        let view = module.load_transaction(&first).await.unwrap().unwrap();
        assert_eq!(view.code, 3);
        assert!(view.transfers.is_empty());
    }
}
