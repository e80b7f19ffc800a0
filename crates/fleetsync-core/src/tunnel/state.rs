//! Stage tables of the tunnel layer and their event wiring
//!
//! Tasks report to their transfer through two wired signals: `on_create`
//! moves the task from its provisional index key to its stored id, and
//! `on_end` drives the transfer's fan-in barrier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::activity::Activity;
use crate::config::EngineConfig;
use crate::context::{Context, Kind, Payload, Target};
use crate::engine::Engine;
use crate::observer::{Signal, Slot};
use crate::registry::ServiceTable;
use crate::runtime::Runtime;
use crate::state::{Schedule, State, StateManager, Status, TaskStage, TransferStage};
use crate::tunnel::task::Task;
use crate::tunnel::transfer::{TIMEOUT_CODE, Transfer};

// ============================================================================
// Task states
// ============================================================================

struct TaskCreatedState;

#[async_trait]
impl State<Task> for TaskCreatedState {
    fn stage(&self) -> TaskStage {
        TaskStage::Created
    }

    async fn enter(&self, status: &mut Status<Task>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Task::create(status, ctx, rt).await;
        status.conclude(self.stage(), "create", result)
    }
}

struct TaskSendingState;

#[async_trait]
impl State<Task> for TaskSendingState {
    fn stage(&self) -> TaskStage {
        TaskStage::Sending
    }

    async fn enter(&self, status: &mut Status<Task>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Task::send(status, ctx, rt).await;
        status.conclude(self.stage(), "send", result)
    }
}

/// Waits for the completion report, forcing a timeout when none arrives
struct TaskSentState {
    watchdog: Duration,
}

#[async_trait]
impl State<Task> for TaskSentState {
    fn stage(&self) -> TaskStage {
        TaskStage::Sent
    }

    async fn enter(&self, status: &mut Status<Task>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Task::recv(status, ctx, rt).await;
        status.conclude(self.stage(), "recv", result)
    }

    fn schedule(&self, status: &Status<Task>) -> Schedule<TaskStage> {
        Schedule::Watchdog(
            self.watchdog,
            TaskStage::Ended,
            Context::forced(status.activity.key(), TIMEOUT_CODE, "Timeout"),
        )
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

struct TaskEndedState;

#[async_trait]
impl State<Task> for TaskEndedState {
    fn stage(&self) -> TaskStage {
        TaskStage::Ended
    }

    async fn enter(&self, status: &mut Status<Task>, ctx: &mut Context, rt: &mut Runtime) -> bool {
        let result = Task::end(status, ctx, rt).await;
        status.conclude(self.stage(), "end", result)
    }
}

// ============================================================================
// Transfer states
// ============================================================================

/// Builds the tasks; also receives each task's `on_create`
struct TransferCreatedState;

#[async_trait]
impl State<Transfer> for TransferCreatedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Created
    }

    async fn enter(
        &self,
        status: &mut Status<Transfer>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transfer::create(status, ctx, rt).await;
        status.conclude(self.stage(), "create", result)
    }

    fn schedule(&self, _status: &Status<Transfer>) -> Schedule<TransferStage> {
        Schedule::Now(TransferStage::Started)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

#[async_trait]
impl Slot for TransferCreatedState {
    async fn complete(&self, engine: &mut Engine, ctx: &mut Context) {
        let (Some(Target::Task { transfer, key }), Some(id)) = (&ctx.sender, &ctx.key) else {
            return;
        };
        let Some(status) = engine.transfers.live_mut(transfer) else {
            debug!(transfer = %transfer, "task created for a transfer that is gone");
            return;
        };

        let tasks = &mut status.activity.tasks;
        if let Some(task) = tasks.remove(key) {
            debug!(transfer = %transfer, from = %key, to = %id, "task rekeyed");
            tasks.insert(id.clone(), task);
        }
    }
}

struct TransferStartedState {
    watchdog: Duration,
}

#[async_trait]
impl State<Transfer> for TransferStartedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Started
    }

    async fn enter(
        &self,
        status: &mut Status<Transfer>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transfer::start(status, ctx, rt).await;
        status.conclude(self.stage(), "start", result)
    }

    fn schedule(&self, _status: &Status<Transfer>) -> Schedule<TransferStage> {
        let ctx = Context {
            data: Payload::Timeout,
            ..Context::default()
        };
        Schedule::Watchdog(self.watchdog, TransferStage::Ended, ctx)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

/// Fan-in barrier; also receives each task's `on_end`
struct TransferEndedState;

#[async_trait]
impl State<Transfer> for TransferEndedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Ended
    }

    async fn enter(
        &self,
        status: &mut Status<Transfer>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transfer::end(status, ctx, rt).await;
        status.conclude(self.stage(), "end", result)
    }

    fn schedule(&self, _status: &Status<Transfer>) -> Schedule<TransferStage> {
        Schedule::Now(TransferStage::Finished)
    }

    fn auto_advance(&self) -> bool {
        true
    }
}

#[async_trait]
impl Slot for TransferEndedState {
    async fn complete(&self, engine: &mut Engine, ctx: &mut Context) {
        let Some(Target::Task { transfer, .. }) = ctx.sender.clone() else {
            return;
        };
        let Ok(manager) = engine.rt.services.manager::<Transfer>() else {
            return;
        };
        let Some(status) = engine.transfers.live_mut(&transfer) else {
            debug!(transfer = %transfer, "task ended for a transfer that is gone");
            return;
        };
        manager
            .transition(status, Some(TransferStage::Ended), ctx, &mut engine.rt)
            .await;
    }
}

struct TransferFinishedState;

#[async_trait]
impl State<Transfer> for TransferFinishedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Finished
    }

    async fn enter(
        &self,
        status: &mut Status<Transfer>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transfer::finish(status, ctx, rt).await;
        status.conclude(self.stage(), "finish", result)
    }
}

struct TransferDeletedState;

#[async_trait]
impl State<Transfer> for TransferDeletedState {
    fn stage(&self) -> TransferStage {
        TransferStage::Deleted
    }

    async fn enter(
        &self,
        status: &mut Status<Transfer>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let result = Transfer::delete(status, ctx, rt).await;
        status.conclude(self.stage(), "delete", result)
    }
}

/// Register the task and transfer managers and wire task signals to transfers
pub fn install(services: &mut ServiceTable, config: &EngineConfig) {
    let created = Arc::new(TransferCreatedState);
    let ended = Arc::new(TransferEndedState);

    let mut tasks = StateManager::<Task>::new();
    tasks.add_state(Arc::new(TaskCreatedState));
    tasks.add_state(Arc::new(TaskSendingState));
    tasks.add_state(Arc::new(TaskSentState {
        watchdog: config.task_watchdog(),
    }));
    tasks.add_state(Arc::new(TaskEndedState));

    let wiring: [(Signal, Arc<dyn Slot>); 2] = [
        (Signal::Created, created.clone()),
        (Signal::Ended, ended.clone()),
    ];
    for (signal, slot) in wiring {
        tasks.events_mut().register(signal, slot);
    }

    let mut transfers = StateManager::<Transfer>::new();
    transfers.add_state(created);
    transfers.add_state(Arc::new(TransferStartedState {
        watchdog: config.transfer_watchdog(),
    }));
    transfers.add_state(ended);
    transfers.add_state(Arc::new(TransferFinishedState));
    transfers.add_state(Arc::new(TransferDeletedState));

    services.insert(Kind::Task.as_str(), Arc::new(tasks));
    services.insert(Kind::Transfer.as_str(), Arc::new(transfers));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_signals_are_wired_to_transfers() {
        let mut services = ServiceTable::new();
        install(&mut services, &EngineConfig::default());

        let tasks = services.manager::<Task>().unwrap();
        assert!(tasks.events().is_wired(Signal::Created));
        assert!(tasks.events().is_wired(Signal::Ended));
        assert!(!tasks.events().is_wired(Signal::Sent));
        assert!(tasks.state(TaskStage::Sent).is_some_and(|s| s.auto_advance()));

        let transfers = services.manager::<Transfer>().unwrap();
        for stage in [
            TransferStage::Created,
            TransferStage::Started,
            TransferStage::Ended,
            TransferStage::Finished,
            TransferStage::Deleted,
        ] {
            assert!(transfers.state(stage).is_some());
        }
    }
}
