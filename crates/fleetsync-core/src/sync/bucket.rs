//! Bucket: the sync-side proxy of one downstream transfer

use async_trait::async_trait;
use fleetsync_api::Application;
use fleetsync_api::requests::{HostEntry, TransferPostRequest};
use fleetsync_api::responses::TransferView;
use serde_json::{Value, json};

use crate::activity::Activity;
use crate::bus::{Endpoint, topic};
use crate::context::{Context, Kind, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::runtime::{LoopEvent, Runtime};
use crate::state::{Stage, Status, TransferStage};
use crate::sync::dispatch::Batch;

/// Code recorded on a bucket whose transfer could not be created
pub const POST_FAILED: i32 = 502;

#[derive(Debug, Clone)]
pub struct Bucket {
    pub transaction_id: ObjectId,
    /// Position inside the transaction, the provisional key
    pub index: usize,
    pub shard: u8,
    pub hosts: Vec<HostEntry>,
    pub retry: u32,
    pub timeout: u64,
    pub application: Application,
    /// Id of the downstream transfer once created
    pub transfer_id: Option<ObjectId>,
    /// Whether the transaction has counted this bucket
    pub ended: bool,
    /// Last view fetched from the tunnel
    pub view: Option<TransferView>,
}

impl Bucket {
    #[must_use]
    pub fn new(
        transaction_id: ObjectId,
        index: usize,
        batch: Batch,
        retry: u32,
        timeout: u64,
        application: &Application,
    ) -> Self {
        Self {
            transaction_id,
            index,
            shard: batch.shard,
            hosts: batch.hosts,
            retry,
            timeout,
            application: application.clone(),
            transfer_id: None,
            ended: false,
            view: None,
        }
    }

    /// Record that the downstream transfer could not be created
    pub fn fail(status: &mut Status<Self>, reason: &str, rt: &Runtime) {
        status.record(POST_FAILED, format!("transfer creation failed: {reason}"), rt);
    }

    /// Whether the fetched view is final and need not be queried again
    #[must_use]
    pub fn settled(status: &Status<Self>) -> bool {
        status
            .activity
            .view
            .as_ref()
            .is_some_and(|view| view.code >= TransferStage::Finished.code())
    }

    /// Fetched view, or the local record when the tunnel has not answered
    #[must_use]
    pub fn view(status: &Status<Self>) -> TransferView {
        let bucket = &status.activity;
        bucket.view.clone().unwrap_or_else(|| TransferView {
            transfer_id: bucket.transfer_id.map(|id| id.to_string()).unwrap_or_default(),
            transaction_id: bucket.transaction_id.to_string(),
            code: status.code,
            message: status.message.clone(),
            create_time: None,
            last_time: None,
            hosts: bucket.hosts.clone(),
            results: Vec::new(),
        })
    }

    /// Stored form inside the transaction record
    #[must_use]
    pub fn stored(status: &Status<Self>) -> Value {
        let bucket = &status.activity;
        json!({
            "index": bucket.index,
            "shard": bucket.shard,
            "hosts": bucket.hosts,
            "transfer_id": bucket.transfer_id,
            "code": status.code,
            "message": status.message,
        })
    }
}

#[async_trait]
impl Activity for Bucket {
    type Stage = TransferStage;

    const KIND: Kind = Kind::Bucket;

    fn key(&self) -> String {
        self.transfer_id
            .map_or_else(|| self.index.to_string(), |id| id.to_string())
    }

    fn target(&self) -> Target {
        Target::Bucket {
            transaction: self.transaction_id,
            key: self.key(),
        }
    }

    async fn create(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        status.record_stage(TransferStage::Created, rt);
        Ok(true)
    }

    /// Ask the shard's tunnel to create the transfer
    async fn start(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let bucket = &status.activity;
        let request = TransferPostRequest {
            transaction_id: bucket.transaction_id.to_string(),
            hosts: bucket.hosts.clone(),
            retry: bucket.retry,
            timeout: bucket.timeout,
            application: bucket.application.clone(),
        };
        let payload = serde_json::to_value(request).map_err(|e| CoreError::Bus(e.to_string()))?;

        let transaction = bucket.transaction_id;
        let key = bucket.key();
        rt.call(
            Endpoint::Tunnel {
                shard: bucket.shard,
            },
            topic::TRANSFER_POST,
            payload,
            move |result| LoopEvent::TransferPosted {
                transaction,
                bucket: key,
                result,
            },
        );

        status.record_stage(TransferStage::Started, rt);
        Ok(true)
    }

    async fn finish(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransferStage::Finished;
        if status.code == stage.code() {
            return Ok(false);
        }
        status.record_stage(stage, rt);
        Ok(true)
    }
}
