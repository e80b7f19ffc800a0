//! Transaction: one logical request fanned out over shards

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetsync_api::Application;
use fleetsync_api::events::FleetEvent;
use fleetsync_api::requests::{Dst, TransactionPostRequest, TransferGetRequest};
use fleetsync_api::responses::TransactionView;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::bus::{Endpoint, topic};
use crate::config::EngineConfig;
use crate::context::{Context, Kind, Payload, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::observer::Signal;
use crate::registry::Deduplicate;
use crate::runtime::{LoopEvent, Runtime};
use crate::state::{Stage, Status, TransactionStage, TransferStage};
use crate::sync::bucket::{Bucket, POST_FAILED};
use crate::sync::dispatch::{Batch, dispatch};

/// Normalized creation request; equal work means the same transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionWork {
    pub dst: Dst,
    pub retry: u32,
    pub timeout: u64,
    pub application: Application,
}

impl TransactionWork {
    /// Apply the configured defaults to a request
    #[must_use]
    pub fn from_request(request: TransactionPostRequest, config: &EngineConfig) -> Self {
        Self {
            dst: request.dst,
            retry: request.retry.unwrap_or(config.default_retry),
            timeout: request.timeout.unwrap_or(config.default_timeout_secs),
            application: request.application,
        }
    }
}

/// Party waiting for an aggregated view
#[derive(Debug)]
pub enum QueryWaiter {
    /// An external caller
    Caller(oneshot::Sender<Result<TransactionView, CoreError>>),
    /// The transaction's own archive step
    Archive,
}

pub struct Transaction {
    /// Provisional until the record is persisted
    pub id: ObjectId,
    pub work: TransactionWork,
    pub create_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    /// Resolved host batches awaiting bucket creation
    pub batches: Vec<Batch>,
    /// Buckets by transfer id (by index until the transfer exists)
    pub buckets: BTreeMap<String, Status<Bucket>>,
    /// Transfer ends that arrived before the transfer's creation reply
    pub early_ends: BTreeSet<String>,
    pub waiters: Vec<QueryWaiter>,
    /// Waiters that need a fan-out started after they arrived
    pub deferred: Vec<QueryWaiter>,
    /// Transfer views still outstanding for the running query
    pub querying: usize,
    /// Whether the archive notification was delivered
    pub notified: bool,
}

impl Transaction {
    #[must_use]
    pub fn new(work: TransactionWork) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::new(),
            work,
            create_time: now,
            last_time: now,
            batches: Vec::new(),
            buckets: BTreeMap::new(),
            early_ends: BTreeSet::new(),
            waiters: Vec::new(),
            deferred: Vec::new(),
            querying: 0,
            notified: false,
        }
    }

    /// Resolve the destination into hosts and partition them by shard
    ///
    /// Returns the number of hosts resolved.
    ///
    /// # Errors
    /// Returns `CoreError::Validation` for an unparsable filter, an unknown
    /// hostname or a host id without a shard digit.
    pub async fn dispatch(&mut self, rt: &Runtime) -> Result<usize, CoreError> {
        let inventory = rt.inventory();
        let hosts = match &self.work.dst {
            Dst::Filter(expr) => inventory.query_by_filter(expr).await?,
            Dst::Hosts(entries) => inventory.query_by_dst(entries).await?,
        };

        let config = rt.config();
        self.batches = dispatch(
            hosts,
            config.shard_offset,
            config.shard_count,
            config.bucket_capacity,
        )?;
        Ok(self.batches.iter().map(|batch| batch.hosts.len()).sum())
    }

    fn ordered(&self) -> Vec<&Status<Bucket>> {
        let mut buckets: Vec<&Status<Bucket>> = self.buckets.values().collect();
        buckets.sort_by_key(|bucket| bucket.activity.index);
        buckets
    }

    async fn persist_buckets(&self, rt: &Runtime) -> Result<(), CoreError> {
        let records = self.ordered().into_iter().map(Bucket::stored).collect();
        rt.sync_store()?
            .update_transfers(&self.id, Value::Array(records))
            .await?;
        Ok(())
    }

    /// Start the first bucket of `shard` that has not been started yet
    async fn start_next(
        status: &mut Status<Self>,
        shard: u8,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let manager = rt.services.manager::<Bucket>()?;
        let Some(bucket) = status
            .activity
            .buckets
            .values_mut()
            .filter(|b| b.activity.shard == shard && b.state == Some(TransferStage::Created))
            .min_by_key(|b| b.activity.index)
        else {
            return Ok(false);
        };

        debug!(transaction = %bucket.activity.transaction_id, shard, bucket = bucket.activity.index, "starting bucket");
        let mut ctx = Context {
            shard: Some(shard),
            ..Context::default()
        };
        Ok(manager
            .transition(bucket, Some(TransferStage::Started), &mut ctx, rt)
            .await)
    }

    /// Write the ended status once every bucket was counted
    async fn seal(status: &mut Status<Self>, rt: &mut Runtime) -> Result<bool, CoreError> {
        let stage = TransactionStage::Ended;
        rt.sync_store()?
            .update_transaction(&status.activity.id, stage.code(), stage.message())
            .await?;
        status.activity.last_time = Utc::now();
        status.record_stage(stage, rt);
        Ok(true)
    }

    /// A bucket's transfer creation was answered
    ///
    /// On success the bucket moves from its index key to the transfer id; on
    /// failure it is counted as ended. Either way the next bucket of the same
    /// shard is started.
    pub async fn complete_start(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let Some(Target::Bucket { key, .. }) = ctx.sender.clone() else {
            return Ok(false);
        };
        let transaction = &mut status.activity;
        let Some(mut bucket) = transaction.buckets.remove(&key) else {
            return Ok(false);
        };

        let shard = bucket.activity.shard;
        let target = Target::Transaction(transaction.id);
        match ctx.key.as_deref().map(ObjectId::parse) {
            Some(Ok(transfer_id)) => {
                let permanent = transfer_id.to_string();
                info!(
                    transaction = %transaction.id,
                    bucket = %key,
                    transfer = %permanent,
                    shard,
                    "transfer created downstream"
                );
                bucket.activity.transfer_id = Some(transfer_id);
                transaction.buckets.insert(permanent.clone(), bucket);

                if transaction.early_ends.remove(&permanent) {
                    rt.wake(LoopEvent::Advance {
                        target,
                        code: TransactionStage::Ended.code(),
                        ctx: Context::keyed(permanent),
                    });
                }
            }
            invalid => {
                if let Some(Err(e)) = invalid {
                    Bucket::fail(&mut bucket, &e.to_string(), rt);
                }
                warn!(
                    transaction = %transaction.id,
                    bucket = %key,
                    shard,
                    "transfer creation failed, counting bucket as ended"
                );
                transaction.buckets.insert(key.clone(), bucket);
                rt.wake(LoopEvent::Advance {
                    target,
                    code: TransactionStage::Ended.code(),
                    ctx: Context::keyed(key),
                });
            }
        }

        transaction.persist_buckets(rt).await?;
        Self::start_next(status, shard, rt).await
    }

    /// Fetch every transfer's view and answer `waiter` with the aggregate
    ///
    /// Concurrent callers share the fan-out in flight. The archive step never
    /// does: views fetched before the transaction ended may be stale, so it
    /// waits for a fresh fan-out once the running one resolved.
    pub fn query(
        status: &mut Status<Self>,
        waiter: QueryWaiter,
        rt: &mut Runtime,
    ) -> Result<(), CoreError> {
        let transaction = &mut status.activity;
        if transaction.querying > 0 {
            match waiter {
                QueryWaiter::Caller(_) => {
                    debug!(transaction = %transaction.id, "joined running query");
                    transaction.waiters.push(waiter);
                }
                QueryWaiter::Archive => {
                    debug!(transaction = %transaction.id, "archive waits for a fresh query");
                    transaction.deferred.push(waiter);
                }
            }
            return Ok(());
        }

        transaction.waiters.push(waiter);
        Self::fan_out(status, rt)
    }

    /// Issue one `transfer.get` per unsettled bucket
    fn fan_out(status: &mut Status<Self>, rt: &mut Runtime) -> Result<(), CoreError> {
        let transaction = &mut status.activity;
        let mut pending = 0;
        for bucket in transaction.buckets.values() {
            let Some(transfer_id) = bucket.activity.transfer_id else {
                continue;
            };
            if Bucket::settled(bucket) {
                continue;
            }

            let request = TransferGetRequest {
                transfer_id: transfer_id.to_string(),
            };
            let payload =
                serde_json::to_value(request).map_err(|e| CoreError::Bus(e.to_string()))?;
            let id = transaction.id;
            let key = bucket.activity.key();
            rt.call(
                Endpoint::Tunnel {
                    shard: bucket.activity.shard,
                },
                topic::TRANSFER_GET,
                payload,
                move |result| LoopEvent::TransferQueried {
                    transaction: id,
                    bucket: key,
                    result,
                },
            );
            pending += 1;
        }

        transaction.querying = pending;
        if pending == 0 {
            Self::resolve(status, rt)?;
        }
        Ok(())
    }

    /// One transfer view arrived; resolve the waiters after the last one
    pub fn complete_query(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let transaction = &mut status.activity;
        if let (Some(Target::Bucket { key, .. }), Payload::View(view)) = (&ctx.sender, &ctx.data) {
            if let Some(bucket) = transaction.buckets.get_mut(key) {
                bucket.activity.view = Some(view.clone());
            }
        }

        if transaction.querying == 0 {
            return Ok(false);
        }
        transaction.querying -= 1;
        if transaction.querying > 0 {
            return Ok(false);
        }

        Self::resolve(status, rt)?;
        Ok(true)
    }

    fn resolve(status: &mut Status<Self>, rt: &mut Runtime) -> Result<(), CoreError> {
        let view = Self::view(status);
        let waiters = std::mem::take(&mut status.activity.waiters);
        for waiter in waiters {
            match waiter {
                QueryWaiter::Caller(reply) => {
                    let _ = reply.send(Ok(view.clone()));
                }
                QueryWaiter::Archive => Self::deliver(status, &view, rt)?,
            }
        }

        let ctx = Context {
            data: Payload::Aggregate(Box::new(view)),
            ..Context::default()
        };
        rt.fire(
            Kind::Transaction,
            Signal::Queried,
            status.activity.target(),
            ctx,
        );

        let deferred = std::mem::take(&mut status.activity.deferred);
        if !deferred.is_empty() {
            status.activity.waiters = deferred;
            Self::fan_out(status, rt)?;
        }
        Ok(())
    }

    /// Publish the archived view and post it to the caller's notify address
    fn deliver(
        status: &mut Status<Self>,
        view: &TransactionView,
        rt: &mut Runtime,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_value(view).map_err(|e| CoreError::Notify(e.to_string()))?;
        rt.publish(topic::TRANSACTION_ARCHIVED, body.clone());

        let transaction = status.activity.id;
        match status.activity.work.application.get("notify").and_then(Value::as_str) {
            Some(url) => {
                status.activity.notified = true;
                rt.notify(url.to_string(), body, move |result| LoopEvent::Notified {
                    transaction,
                    result,
                });
            }
            None => rt.wake(LoopEvent::Notified {
                transaction,
                result: Ok(()),
            }),
        }
        Ok(())
    }

    /// Aggregated view over the buckets' transfer views
    #[must_use]
    pub fn view(status: &Status<Self>) -> TransactionView {
        let transaction = &status.activity;
        TransactionView {
            transaction_id: transaction.id.to_string(),
            code: status.code,
            message: status.message.clone(),
            create_time: transaction.create_time,
            last_time: transaction.last_time,
            application: transaction.work.application.clone(),
            transfers: transaction
                .ordered()
                .into_iter()
                .map(Bucket::view)
                .collect(),
        }
    }
}

impl Deduplicate<TransactionWork> for Status<Transaction> {
    fn same_work(&self, candidate: &TransactionWork) -> bool {
        self.activity.work == *candidate
    }
}

#[async_trait]
impl Activity for Transaction {
    type Stage = TransactionStage;

    const KIND: Kind = Kind::Transaction;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn target(&self) -> Target {
        Target::Transaction(self.id)
    }

    async fn create(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransactionStage::Created;
        let id = rt
            .sync_store()?
            .create_transaction(&status.activity.work, stage.code(), stage.message())
            .await?;

        let transaction = &mut status.activity;
        transaction.id = id;
        let manager = rt.services.manager::<Bucket>()?;
        let batches = std::mem::take(&mut transaction.batches);
        for (index, batch) in batches.into_iter().enumerate() {
            let shard = batch.shard;
            let work = &transaction.work;
            let mut bucket = Status::new(Bucket::new(
                id,
                index,
                batch,
                work.retry,
                work.timeout,
                &work.application,
            ));
            let mut ctx = Context::child(id, index, Payload::Empty);
            ctx.shard = Some(shard);
            if !manager
                .transition(&mut bucket, Some(TransferStage::Created), &mut ctx, rt)
                .await
            {
                return Err(CoreError::Conflict(format!(
                    "bucket {index} of transaction {id} could not be created"
                )));
            }
            transaction.buckets.insert(index.to_string(), bucket);
        }
        transaction.persist_buckets(rt).await?;

        info!(transaction = %id, buckets = transaction.buckets.len(), "transaction created");
        status.record_stage(stage, rt);
        Ok(true)
    }

    async fn start(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransactionStage::Started;
        rt.sync_store()?
            .update_transaction(&status.activity.id, stage.code(), stage.message())
            .await?;
        status.record_stage(stage, rt);

        if status.activity.buckets.is_empty() {
            rt.wake(LoopEvent::Advance {
                target: status.activity.target(),
                code: TransactionStage::Ended.code(),
                ctx: Context::default(),
            });
            return Ok(true);
        }

        let shards: Vec<u8> = match ctx.shard {
            Some(shard) => vec![shard],
            None => (0..rt.config().shard_count).collect(),
        };
        for shard in shards {
            Self::start_next(status, shard, rt).await?;
        }
        Ok(true)
    }

    /// Count one ended transfer, keyed by its id in `ctx.key`
    async fn end(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let Some(key) = ctx.key.clone() else {
            return if status.activity.buckets.is_empty() {
                Self::seal(status, rt).await
            } else {
                Ok(false)
            };
        };

        let manager = rt.services.manager::<Bucket>()?;
        let transaction = &mut status.activity;
        let Some(bucket) = transaction.buckets.get_mut(&key) else {
            debug!(transaction = %transaction.id, transfer = %key, "transfer ended before its creation reply");
            transaction.early_ends.insert(key);
            return Ok(false);
        };
        if bucket.activity.ended {
            return Ok(false);
        }

        bucket.activity.ended = true;
        if bucket.code != POST_FAILED {
            let mut finished = Context::keyed(key.clone());
            manager
                .transition(bucket, Some(TransferStage::Finished), &mut finished, rt)
                .await;
        }
        transaction.persist_buckets(rt).await?;

        let remaining = transaction
            .buckets
            .values()
            .filter(|bucket| !bucket.activity.ended)
            .count();
        info!(transaction = %transaction.id, transfer = %key, remaining, "transfer ended");
        if remaining > 0 {
            return Ok(false);
        }
        Self::seal(status, rt).await
    }

    async fn finish(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransactionStage::Finished;
        if status.code == stage.code() {
            return Ok(false);
        }
        rt.sync_store()?
            .update_transaction(&status.activity.id, stage.code(), stage.message())
            .await?;
        status.activity.last_time = Utc::now();
        status.record_stage(stage, rt);
        Ok(true)
    }

    /// Refetch the aggregate and hand it to the caller's notify address
    async fn archive(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        Self::query(status, QueryWaiter::Archive, rt)?;
        Ok(true)
    }

    async fn delete(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let transaction = &status.activity;
        rt.sync_store()?.deactivate(&transaction.id).await?;

        info!(transaction = %transaction.id, notified = transaction.notified, "transaction archived");
        rt.emit(FleetEvent::TransactionArchived {
            id: transaction.id.to_string(),
            notified: transaction.notified,
        });
        rt.wake(LoopEvent::Retire(transaction.target()));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use fleetsync_api::requests::{DstEntry, HostEntry};
    use fleetsync_api::responses::{HostResult, TransferView};

    use super::*;

    fn work(retry: Option<u32>) -> TransactionWork {
        let request = TransactionPostRequest {
            dst: Dst::Hosts(vec![DstEntry::Host("edge-01".to_string())]),
            retry,
            timeout: None,
            application: Application::new(),
        };
        TransactionWork::from_request(request, &EngineConfig::default())
    }

    #[test]
    fn test_defaults_take_part_in_dedup() {
        let status = Status::new(Transaction::new(work(None)));
        assert!(status.same_work(&work(Some(3))));
        assert!(!status.same_work(&work(Some(1))));
    }

    #[tokio::test]
    async fn test_query_without_transfers_resolves_at_once() {
        let (mut rt, _rx) = Runtime::detached();
        let mut status = Status::new(Transaction::new(work(None)));
        status.code = TransactionStage::Finished.code();

        let (tx, rx) = oneshot::channel();
        Transaction::query(&mut status, QueryWaiter::Caller(tx), &mut rt).unwrap();

        let view = rx.await.unwrap().unwrap();
        assert_eq!(view.code, 3);
        assert!(view.transfers.is_empty());
        assert_eq!(rt.next_fired().map(|f| f.signal), Some(Signal::Queried));
    }

    /// Transaction with one bucket on shard 10
    fn with_bucket(transfer_id: Option<ObjectId>) -> (Status<Transaction>, String) {
        let mut status = Status::new(Transaction::new(work(None)));
        let batch = Batch {
            shard: 10,
            hosts: vec![HostEntry {
                host: "0000000a-0001".to_string(),
                hostname: "edge-01".to_string(),
                context: Application::new(),
            }],
        };
        let mut bucket = Status::new(Bucket::new(
            status.activity.id,
            0,
            batch,
            3,
            5,
            &Application::new(),
        ));
        bucket.activity.transfer_id = transfer_id;
        let key = bucket.activity.key();
        status.activity.buckets.insert(key.clone(), bucket);
        (status, key)
    }

    fn transfer_view(transfer_id: ObjectId, code: i32, result: i32) -> TransferView {
        TransferView {
            transfer_id: transfer_id.to_string(),
            transaction_id: String::new(),
            code,
            message: String::new(),
            create_time: None,
            last_time: None,
            hosts: Vec::new(),
            results: vec![HostResult {
                host: "edge-01".to_string(),
                code: result,
                message: String::new(),
                trace: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_archive_waits_for_a_fresh_fan_out() {
        let (mut rt, _rx) = Runtime::detached();
        let transfer = ObjectId::new();
        let (mut status, key) = with_bucket(Some(transfer));
        let sender = status.activity.buckets[&key].activity.target();

        let (tx, rx) = oneshot::channel();
        Transaction::query(&mut status, QueryWaiter::Caller(tx), &mut rt).unwrap();
        assert_eq!(status.activity.querying, 1);

        status.code = TransactionStage::Finished.code();
        Transaction::query(&mut status, QueryWaiter::Archive, &mut rt).unwrap();
        assert_eq!(status.activity.waiters.len(), 1);
        assert_eq!(status.activity.deferred.len(), 1);

        // A view fetched while the task was still running answers the caller only
        let mut stale = Context {
            sender: Some(sender.clone()),
            data: Payload::View(transfer_view(transfer, 11, 22)),
            ..Context::default()
        };
        assert!(Transaction::complete_query(&mut status, &mut stale, &mut rt).unwrap());
        let answered = rx.await.unwrap().unwrap();
        assert_eq!(answered.transfers[0].code, 11);
        assert_eq!(status.activity.querying, 1);
        assert!(status.activity.deferred.is_empty());
        assert!(rt.next_woken().is_none());

        let mut fresh = Context {
            sender: Some(sender),
            data: Payload::View(transfer_view(transfer, 13, 200)),
            ..Context::default()
        };
        assert!(Transaction::complete_query(&mut status, &mut fresh, &mut rt).unwrap());
        assert!(status.activity.waiters.is_empty());
        assert!(matches!(
            rt.next_woken(),
            Some(LoopEvent::Notified { result: Ok(()), .. })
        ));
        let archived = Transaction::view(&status);
        assert_eq!(archived.transfers[0].results[0].code, 200);
    }

    #[tokio::test]
    async fn test_end_before_creation_reply_is_replayed() {
        let (mut rt, _rx) = Runtime::detached();
        crate::sync::state::install(&mut rt.services, &EngineConfig::default());
        let (mut status, key) = with_bucket(None);
        let transfer = ObjectId::new().to_string();

        let mut early = Context::keyed(transfer.clone());
        assert!(!Transaction::end(&mut status, &mut early, &mut rt).await.unwrap());
        assert!(status.activity.early_ends.contains(&transfer));
        assert!(rt.next_woken().is_none());

        let mut reply = Context {
            key: Some(transfer.clone()),
            sender: Some(Target::Bucket {
                transaction: status.activity.id,
                key: key.clone(),
            }),
            ..Context::default()
        };
        Transaction::complete_start(&mut status, &mut reply, &mut rt)
            .await
            .unwrap();
        assert!(status.activity.buckets.contains_key(&transfer));
        assert!(!status.activity.buckets.contains_key(&key));
        assert!(status.activity.early_ends.is_empty());

        match rt.next_woken() {
            Some(LoopEvent::Advance { code, ctx, .. }) => {
                assert_eq!(code, TransactionStage::Ended.code());
                assert_eq!(ctx.key, Some(transfer));
            }
            other => panic!("expected the end to be replayed, got {other:?}"),
        }
    }
}
