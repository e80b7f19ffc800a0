//! Stage tables of the sync layer and their event wiring
//!
//! Buckets report to their transaction through two wired signals:
//! `on_start` once the downstream transfer answered its creation, and
//! `on_query` for each transfer view collected by a running query.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::activity::Activity;
use crate::config::EngineConfig;
use crate::context::{Context, Kind, Target};
use crate::engine::Engine;
use crate::id::ObjectId;
use crate::observer::{Signal, Slot};
use crate::registry::ServiceTable;
use crate::runtime::Runtime;
use crate::state::{Schedule, State, StateManager, Status, TransactionStage, TransferStage};
use crate::sync::bucket::Bucket;
use crate::sync::transaction::Transaction;

fn sending_transaction(ctx: &Context) -> Option<ObjectId> {
    match &ctx.sender {
        Some(Target::Bucket { transaction, .. }) => Some(*transaction),
        _ => None,
    }
}

// ============================================================================
// Bucket states
// ============================================================================

struct BucketCreatedState;

#[async_trait]
impl State<Bucket> for BucketCreatedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Created
    }

    async fn enter(&self, status: &mut Status<Bucket>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Bucket::create(status, ctx, rt).await;
        status.conclude(self.stage(), "create", result)
    }

    /// Started by the transaction, one bucket per shard at a time
    fn schedule(&self, _status: &Status<Bucket>) -> Schedule<TransferStage> {
        Schedule::Now(TransferStage::Started)
    }
}

struct BucketStartedState;

#[async_trait]
impl State<Bucket> for BucketStartedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Started
    }

    async fn enter(&self, status: &mut Status<Bucket>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Bucket::start(status, ctx, rt).await;
        status.conclude(self.stage(), "start", result)
    }
}

struct BucketFinishedState;

#[async_trait]
impl State<Bucket> for BucketFinishedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Finished
    }

    async fn enter(&self, status: &mut Status<Bucket>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Bucket::finish(status, ctx, rt).await;
        status.conclude(self.stage(), "finish", result)
    }
}

// ============================================================================
// Transaction states
// ============================================================================

struct TransactionCreatedState;

#[async_trait]
impl State<Transaction> for TransactionCreatedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Created
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::create(status, ctx, rt).await;
        status.conclude(self.stage(), "create", result)
    }

    fn schedule(&self, _status: &Status<Transaction>) -> Schedule<TransactionStage> {
        Schedule::Now(TransactionStage::Started)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

/// Starts the buckets; also receives each bucket's `on_start`
struct TransactionStartedState;

#[async_trait]
impl State<Transaction> for TransactionStartedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Started
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::start(status, ctx, rt).await;
        status.conclude(self.stage(), "start", result)
    }
}

#[async_trait]
impl Slot for TransactionStartedState {
    async fn complete(&self, engine: &mut Engine, ctx: &mut Context) {
        let Some(id) = sending_transaction(ctx) else {
            return;
        };
        let Some(status) = engine.transactions.live_mut(&id) else {
            debug!(transaction = %id, "bucket started for a transaction that is gone");
            return;
        };
        let result = Transaction::complete_start(status, ctx, &mut engine.rt).await;
        status.settle("complete_start", result);
    }
}

/// Collects transfer views for a running query
struct QueryCollector;

#[async_trait]
impl Slot for QueryCollector {
    async fn complete(&self, engine: &mut Engine, ctx: &mut Context) {
        let Some(id) = sending_transaction(ctx) else {
            return;
        };
        let Some(status) = engine.transactions.lookup_mut(&id) else {
            return;
        };
        let result = Transaction::complete_query(status, ctx, &mut engine.rt);
        status.settle("complete_query", result);
    }
}

struct TransactionEndedState;

#[async_trait]
impl State<Transaction> for TransactionEndedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Ended
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::end(status, ctx, rt).await;
        status.conclude(self.stage(), "end", result)
    }

    fn schedule(&self, _status: &Status<Transaction>) -> Schedule<TransactionStage> {
        Schedule::Now(TransactionStage::Finished)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

struct TransactionFinishedState;

#[async_trait]
impl State<Transaction> for TransactionFinishedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Finished
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::finish(status, ctx, rt).await;
        status.conclude(self.stage(), "finish", result)
    }

    fn schedule(&self, _status: &Status<Transaction>) -> Schedule<TransactionStage> {
        Schedule::Now(TransactionStage::Archived)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

struct TransactionArchivedState;

#[async_trait]
impl State<Transaction> for TransactionArchivedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Archived
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::archive(status, ctx, rt).await;
        status.conclude(self.stage(), "archive", result)
    }
}

struct TransactionDeletedState;

#[async_trait]
impl State<Transaction> for TransactionDeletedState {
    fn stage(&self) -> TransactionStage {
        TransactionStage::Deleted
    }

    async fn enter(
        &self,
        status: &mut Status<Transaction>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transaction::delete(status, ctx, rt).await;
        status.conclude(self.stage(), "delete", result)
    }
}

/// Register the bucket and transaction managers and wire bucket signals
pub fn install(services: &mut ServiceTable, _config: &EngineConfig) {
    let started = Arc::new(TransactionStartedState);

    let mut buckets = StateManager::<Bucket>::new();
    buckets.add_state(Arc::new(BucketCreatedState));
    buckets.add_state(Arc::new(BucketStartedState));
    buckets.add_state(Arc::new(BucketFinishedState));

    let wiring: [(Signal, Arc<dyn Slot>); 2] = [
        (Signal::Started, started.clone()),
        (Signal::Queried, Arc::new(QueryCollector)),
    ];
    for (signal, slot) in wiring {
        buckets.events_mut().register(signal, slot);
    }

    let mut transactions = StateManager::<Transaction>::new();
    transactions.add_state(Arc::new(TransactionCreatedState));
    transactions.add_state(started);
    transactions.add_state(Arc::new(TransactionEndedState));
    transactions.add_state(Arc::new(TransactionFinishedState));
    transactions.add_state(Arc::new(TransactionArchivedState));
    transactions.add_state(Arc::new(TransactionDeletedState));

    services.insert(Kind::Bucket.as_str(), Arc::new(buckets));
    services.insert(Kind::Transaction.as_str(), Arc::new(transactions));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_signals_are_wired_to_transactions() {
        let mut services = ServiceTable::new();
        install(&mut services, &EngineConfig::default());

        let buckets = services.manager::<Bucket>().unwrap();
        assert!(buckets.events().is_wired(Signal::Started));
        assert!(buckets.events().is_wired(Signal::Queried));
        assert!(!buckets.events().is_wired(Signal::Ended));

        let transactions = services.manager::<Transaction>().unwrap();
        assert!(!transactions.events().is_wired(Signal::Queried));
        assert!(
            transactions
                .state(TransactionStage::Created)
                .is_some_and(|s| s.auto_advance())
        );
        assert!(
            transactions
                .state(TransactionStage::Archived)
                .is_some_and(|s| !s.auto_advance())
        );
    }
}
