//! The orchestration engine
//!
//! [`Engine`] owns every live transaction and transfer together with the
//! runtime. External requests and [`LoopEvent`]s are applied one at a time;
//! after each, [`Engine::drain`] delivers the signals fired and the
//! transitions woken while handling it.

use std::sync::Arc;

use fleetsync_api::events::FleetEvent;
use fleetsync_api::requests::{TransactionPostRequest, TransferPostRequest, TransferPutRequest};
use fleetsync_api::responses::{
    RecordSummary, StatusResponse, TransactionPostResponse, TransactionView, TransferPostResponse,
    TransferView,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, unsupported};
use crate::config::EngineConfig;
use crate::context::{Context, Kind, Payload, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::observer::{Fired, Signal};
use crate::registry::ObjectRegistry;
use crate::runtime::{Collaborators, LoopEvent, Runtime};
use crate::state::{Stage, StateManager, Status, TaskStage, TransactionStage, TransferStage};
use crate::store::CodeRange;
use crate::sync::{Bucket, QueryWaiter, Transaction, TransactionWork};
use crate::tunnel::{Task, Transfer};

fn codes(code: Option<i32>) -> CodeRange {
    code.map_or(CodeRange(i32::MIN..=i32::MAX), CodeRange::from)
}

/// Single owner of all orchestration state
pub struct Engine {
    pub(crate) rt: Runtime,
    pub(crate) transactions: ObjectRegistry<Status<Transaction>>,
    pub(crate) transfers: ObjectRegistry<Status<Transfer>>,
}

impl Engine {
    /// Build an engine and install the state tables of both layers
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
        event_tx: broadcast::Sender<FleetEvent>,
        loop_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        let mut rt = Runtime::new(config.clone(), collaborators, event_tx, loop_tx);
        crate::tunnel::state::install(&mut rt.services, &config);
        crate::sync::state::install(&mut rt.services, &config);

        Self {
            rt,
            transactions: ObjectRegistry::new(),
            transfers: ObjectRegistry::new(),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.rt.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.rt.config()
    }

    /// Live and cached entity counts: `(transactions, transfers)`
    #[must_use]
    pub fn counts(&self) -> ((usize, usize), (usize, usize)) {
        (
            (self.transactions.live_len(), self.transactions.cached_len()),
            (self.transfers.live_len(), self.transfers.cached_len()),
        )
    }

    fn manager<A: Activity>(&self) -> Option<Arc<StateManager<A>>> {
        self.rt
            .services
            .manager::<A>()
            .map_err(|e| error!(kind = %A::KIND, error = %e, "state manager missing"))
            .ok()
    }

    // ========================================================================
    // Sync operations
    // ========================================================================

    /// Create a transaction, or return the live one doing the same work
    pub async fn create_transaction(
        &mut self,
        request: TransactionPostRequest,
    ) -> Result<TransactionPostResponse, CoreError> {
        let work = TransactionWork::from_request(request, self.rt.config());

        if let Some(id) = self.transactions.deduplicate(&work) {
            info!(transaction = %id, "duplicate transaction request");
            return self.transaction_response(&id);
        }

        let mut status = Status::new(Transaction::new(work));
        let hosts = status.activity.dispatch(&self.rt).await?;

        let manager = self.rt.services.manager::<Transaction>()?;
        let mut ctx = Context::default();
        if !manager
            .transition(&mut status, None, &mut ctx, &mut self.rt)
            .await
        {
            return Err(CoreError::Conflict(
                "transaction could not be created".to_string(),
            ));
        }

        let id = status.activity.id;
        if self.transactions.is_live(&id) || self.transactions.is_cached(&id) {
            return self.transaction_response(&id);
        }

        info!(transaction = %id, hosts, buckets = status.activity.buckets.len(), "transaction registered");
        self.transactions.register(id, status);
        self.drain().await;
        self.transaction_response(&id)
    }

    fn transaction_response(&self, id: &ObjectId) -> Result<TransactionPostResponse, CoreError> {
        let status = self
            .transactions
            .lookup(id)
            .ok_or_else(|| CoreError::not_found("transaction", id.to_string()))?;
        Ok(TransactionPostResponse {
            transaction_id: id.to_string(),
            code: status.code,
            message: status.message.clone(),
        })
    }

    /// Answer `reply` with the aggregated view of a transaction
    ///
    /// Live transactions fetch their transfers' views first; the reply is
    /// sent once the last one arrived.
    pub async fn query_transaction(
        &mut self,
        id: &str,
        reply: oneshot::Sender<Result<TransactionView, CoreError>>,
    ) {
        let id = match ObjectId::parse(id) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if let Some(status) = self.transactions.lookup_mut(&id) {
            let result = Transaction::query(status, QueryWaiter::Caller(reply), &mut self.rt);
            status.settle("query", result.map(|()| true));
            self.drain().await;
            return;
        }

        let stored = match self.rt.sync_store() {
            Ok(module) => module.load_transaction(&id).await,
            Err(e) => Err(e),
        };
        let _ = reply.send(
            stored.and_then(|view| {
                view.ok_or_else(|| CoreError::not_found("transaction", id.to_string()))
            }),
        );
    }

    /// Count one downstream transfer of a transaction as ended
    pub async fn end_transfer(
        &mut self,
        transaction_id: &str,
        transfer_id: &str,
    ) -> Result<StatusResponse, CoreError> {
        let id = ObjectId::parse(transaction_id)?;
        let transfer = ObjectId::parse(transfer_id)?;
        let manager = self.rt.services.manager::<Transaction>()?;

        let Some(status) = self.transactions.live_mut(&id) else {
            if self.transactions.is_cached(&id) {
                debug!(transaction = %id, transfer = %transfer, "end for an archived transaction");
                return Ok(StatusResponse::success());
            }
            return Err(CoreError::not_found("transaction", transaction_id));
        };

        let mut ctx = Context::keyed(transfer.to_string());
        manager
            .transition(status, Some(TransactionStage::Ended), &mut ctx, &mut self.rt)
            .await;
        self.drain().await;
        Ok(StatusResponse::success())
    }

    pub async fn list_transactions(
        &self,
        code: Option<i32>,
    ) -> Result<Vec<RecordSummary>, CoreError> {
        self.rt.sync_store()?.find_transactions(codes(code)).await
    }

    /// Transactions are removed by archiving only
    pub fn delete_transaction(&self, id: &str) -> Result<StatusResponse, CoreError> {
        ObjectId::parse(id)?;
        unsupported::<Transaction, _>("delete")
    }

    // ========================================================================
    // Tunnel operations
    // ========================================================================

    /// Create a transfer, or return the live one doing the same work
    pub async fn create_transfer(
        &mut self,
        request: TransferPostRequest,
    ) -> Result<TransferPostResponse, CoreError> {
        if let Some(id) = self.transfers.deduplicate(&request) {
            info!(transfer = %id, "duplicate transfer request");
            return self.transfer_response(&id);
        }

        let manager = self.rt.services.manager::<Transfer>()?;
        let mut status = Status::new(Transfer::new(request));
        let mut ctx = Context::default();
        if !manager
            .transition(&mut status, None, &mut ctx, &mut self.rt)
            .await
        {
            return Err(CoreError::Conflict(
                "transfer could not be created".to_string(),
            ));
        }

        let id = status.activity.id;
        if self.transfers.is_live(&id) || self.transfers.is_cached(&id) {
            return self.transfer_response(&id);
        }

        info!(
            transfer = %id,
            transaction = %status.activity.transaction_id,
            tasks = status.activity.tasks.len(),
            "transfer registered"
        );
        self.transfers.register(id, status);
        self.drain().await;
        self.transfer_response(&id)
    }

    fn transfer_response(&self, id: &ObjectId) -> Result<TransferPostResponse, CoreError> {
        let status = self
            .transfers
            .lookup(id)
            .ok_or_else(|| CoreError::not_found("transfer", id.to_string()))?;
        Ok(TransferPostResponse {
            transfer_id: id.to_string(),
            code: status.code,
            message: status.message.clone(),
        })
    }

    pub async fn query_transfer(&self, id: &str) -> Result<TransferView, CoreError> {
        let id = ObjectId::parse(id)?;
        if let Some(status) = self.transfers.lookup(&id) {
            return Ok(Transfer::view(status));
        }
        self.rt
            .tunnel_store()?
            .load_transfer(&id)
            .await?
            .ok_or_else(|| CoreError::not_found("transfer", id.to_string()))
    }

    /// Apply an agent's completion report to one task
    pub async fn report_task(
        &mut self,
        transfer_id: &str,
        report: TransferPutRequest,
    ) -> Result<StatusResponse, CoreError> {
        let id = ObjectId::parse(transfer_id)?;
        let manager = self.rt.services.manager::<Transfer>()?;

        let Some(status) = self.transfers.live_mut(&id) else {
            if self.transfers.is_cached(&id) {
                debug!(transfer = %id, task = %report.task_id, "report for a retired transfer");
                return Ok(StatusResponse::success());
            }
            return Err(CoreError::not_found("transfer", transfer_id));
        };
        if !status.activity.tasks.contains_key(&report.task_id) {
            return Err(CoreError::not_found("task", report.task_id));
        }

        let mut ctx = Context::report(report);
        manager
            .transition(status, Some(TransferStage::Ended), &mut ctx, &mut self.rt)
            .await;
        self.drain().await;
        Ok(StatusResponse::success())
    }

    pub async fn list_transfers(&self, code: Option<i32>) -> Result<Vec<RecordSummary>, CoreError> {
        self.rt.tunnel_store()?.find_transfers(codes(code)).await
    }

    /// Transfers are removed by finishing only
    pub fn delete_transfer(&self, id: &str) -> Result<StatusResponse, CoreError> {
        ObjectId::parse(id)?;
        unsupported::<Transfer, _>("delete")
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Apply one loop event and everything it sets off
    pub async fn wake(&mut self, event: LoopEvent) {
        self.handle(event).await;
        self.drain().await;
    }

    /// Deliver fired signals, then woken events, until both queues are empty
    pub async fn drain(&mut self) {
        loop {
            if let Some(fired) = self.rt.next_fired() {
                self.dispatch(fired).await;
            } else if let Some(event) = self.rt.next_woken() {
                self.handle(event).await;
            } else {
                break;
            }
        }
    }

    async fn dispatch(&mut self, fired: Fired) {
        let Fired {
            kind,
            signal,
            mut ctx,
        } = fired;

        let slot = match kind {
            Kind::Transaction => self.manager::<Transaction>().map(|m| m.events().slot(signal)),
            Kind::Bucket => self.manager::<Bucket>().map(|m| m.events().slot(signal)),
            Kind::Transfer => self.manager::<Transfer>().map(|m| m.events().slot(signal)),
            Kind::Task => self.manager::<Task>().map(|m| m.events().slot(signal)),
        };

        if let Some(Some(slot)) = slot {
            slot.complete(self, &mut ctx).await;
        }
        signal.default_body(kind, &ctx);
    }

    async fn handle(&mut self, mut event: LoopEvent) {
        while let LoopEvent::Timer { id, event: inner } = event {
            if !self.rt.claim(id) {
                debug!(timer = %id, "cancelled timer ignored");
                return;
            }
            event = *inner;
        }

        match event {
            LoopEvent::Advance {
                target,
                code,
                mut ctx,
            } => self.advance(target, code, &mut ctx).await,
            LoopEvent::TaskCalled {
                transfer,
                task,
                result,
            } => {
                let Some(manager) = self.manager::<Task>() else {
                    return;
                };
                let Some(status) = self
                    .transfers
                    .live_mut(&transfer)
                    .and_then(|t| t.activity.tasks.get_mut(&task))
                else {
                    return;
                };
                if let Some((stage, mut ctx)) = Task::on_called(status, result, &mut self.rt) {
                    manager
                        .transition(status, Some(stage), &mut ctx, &mut self.rt)
                        .await;
                }
            }
            LoopEvent::TaskRetry { transfer, task } => {
                let Some(status) = self
                    .transfers
                    .live_mut(&transfer)
                    .and_then(|t| t.activity.tasks.get_mut(&task))
                else {
                    return;
                };
                if let Err(e) = Task::redial(status, &self.rt) {
                    error!(transfer = %transfer, task = %task, error = %e, "agent call could not be reissued");
                }
            }
            LoopEvent::TransferPosted {
                transaction,
                bucket,
                result,
            } => {
                let Some(status) = self
                    .transactions
                    .live_mut(&transaction)
                    .and_then(|t| t.activity.buckets.get_mut(&bucket))
                else {
                    return;
                };

                let mut ctx = Context {
                    shard: Some(status.activity.shard),
                    ..Context::default()
                };
                match result {
                    Ok(reply) => ctx.key = Some(reply.transfer_id),
                    Err(e) => {
                        error!(transaction = %transaction, bucket = %bucket, error = %e, "transfer creation failed");
                        Bucket::fail(status, &e.to_string(), &self.rt);
                    }
                }
                let target = status.activity.target();
                self.rt.fire(Kind::Bucket, Signal::Started, target, ctx);
            }
            LoopEvent::TransferQueried {
                transaction,
                bucket,
                result,
            } => {
                let Some(status) = self
                    .transactions
                    .lookup_mut(&transaction)
                    .and_then(|t| t.activity.buckets.get_mut(&bucket))
                else {
                    return;
                };

                let data = match result {
                    Ok(view) => Payload::View(view),
                    Err(e) => {
                        warn!(transaction = %transaction, transfer = %bucket, error = %e, "transfer view unavailable");
                        Payload::Empty
                    }
                };
                let target = status.activity.target();
                let ctx = Context {
                    data,
                    ..Context::default()
                };
                self.rt.fire(Kind::Bucket, Signal::Queried, target, ctx);
            }
            LoopEvent::FinishAcked { transfer, result } => {
                let Some(manager) = self.manager::<Transfer>() else {
                    return;
                };
                let Some(status) = self.transfers.live_mut(&transfer) else {
                    return;
                };
                match Transfer::on_finish_acked(status, result, &mut self.rt).await {
                    Ok(Some(next)) => {
                        let mut ctx = Context::default();
                        manager
                            .transition(status, Some(next), &mut ctx, &mut self.rt)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => error!(transfer = %transfer, error = %e, "transfer finish failed"),
                }
            }
            LoopEvent::Notified {
                transaction,
                result,
            } => {
                let Some(manager) = self.manager::<Transaction>() else {
                    return;
                };
                let Some(status) = self.transactions.live_mut(&transaction) else {
                    return;
                };
                if let Err(e) = result {
                    warn!(transaction = %transaction, error = %e, "archive notification failed");
                    status.activity.notified = false;
                }
                let mut ctx = Context::default();
                manager
                    .transition(status, Some(TransactionStage::Deleted), &mut ctx, &mut self.rt)
                    .await;
            }
            LoopEvent::Retire(target) => {
                let retired = match &target {
                    Target::Transaction(id) => self.transactions.retire(id),
                    Target::Transfer(id) => self.transfers.retire(id),
                    Target::Bucket { .. } | Target::Task { .. } => false,
                };
                if retired {
                    let retention = self.rt.config().retention();
                    self.rt.schedule_after(retention, LoopEvent::Evict(target));
                }
            }
            LoopEvent::Evict(target) => match target {
                Target::Transaction(id) => {
                    self.transactions.evict(&id);
                }
                Target::Transfer(id) => {
                    self.transfers.evict(&id);
                }
                Target::Bucket { .. } | Target::Task { .. } => {}
            },
            LoopEvent::Timer { .. } => {}
        }
    }

    /// Enter the stage with `code` on `target`
    async fn advance(&mut self, target: Target, code: i32, ctx: &mut Context) {
        match target {
            Target::Transaction(id) => {
                let (Some(stage), Some(manager)) = (
                    TransactionStage::from_code(code),
                    self.manager::<Transaction>(),
                ) else {
                    return;
                };
                if let Some(status) = self.transactions.live_mut(&id) {
                    manager
                        .transition(status, Some(stage), ctx, &mut self.rt)
                        .await;
                }
            }
            Target::Bucket { transaction, key } => {
                let (Some(stage), Some(manager)) =
                    (TransferStage::from_code(code), self.manager::<Bucket>())
                else {
                    return;
                };
                if let Some(status) = self
                    .transactions
                    .live_mut(&transaction)
                    .and_then(|t| t.activity.buckets.get_mut(&key))
                {
                    manager
                        .transition(status, Some(stage), ctx, &mut self.rt)
                        .await;
                }
            }
            Target::Transfer(id) => {
                let (Some(stage), Some(manager)) =
                    (TransferStage::from_code(code), self.manager::<Transfer>())
                else {
                    return;
                };
                if let Some(status) = self.transfers.live_mut(&id) {
                    manager
                        .transition(status, Some(stage), ctx, &mut self.rt)
                        .await;
                }
            }
            Target::Task { transfer, key } => {
                let (Some(stage), Some(manager)) =
                    (TaskStage::from_code(code), self.manager::<Task>())
                else {
                    return;
                };
                if let Some(status) = self
                    .transfers
                    .live_mut(&transfer)
                    .and_then(|t| t.activity.tasks.get_mut(&key))
                {
                    manager
                        .transition(status, Some(stage), ctx, &mut self.rt)
                        .await;
                }
            }
        }
    }

    /// Abort every pending timer
    pub fn shutdown(&mut self) {
        self.rt.shutdown();
    }
}
