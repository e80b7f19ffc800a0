//! `EngineActor`: serialized access to the orchestration engine
//!
//! Every request and every completion (timer, remote reply, notification)
//! reaches the [`Engine`] as an actor message, so no two of them ever
//! interleave. Completions travel through an unbounded loop channel that a
//! forwarder task turns back into [`Wake`] messages.

use std::sync::Arc;
use std::time::Duration;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, SendError};
use kameo::message::{Context, Message};
use kameo::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use fleetsync_api::events::FleetEvent;
use fleetsync_api::requests::{
    TransactionPutRequest, TransferGetRequest, TransferPostRequest, TransferPutRequest,
};
use fleetsync_api::responses::{
    RecordSummary, StatusResponse, TransactionPostResponse, TransactionView, TransferPostResponse,
    TransferView,
};

use crate::bus::{BusError, FnHandler, LocalBus, topic};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::message::{
    CreateTransaction, CreateTransfer, DeleteTransaction, DeleteTransfer, EndTransfer,
    ListTransactions, ListTransfers, QueryTransaction, QueryTransfer, ReportTask, Wake,
};
use crate::runtime::Collaborators;

/// Arguments for spawning an `EngineActor`
pub struct EngineArgs {
    pub config: Arc<EngineConfig>,
    pub collaborators: Collaborators,
    /// Stage changes and retries are broadcast here
    pub event_tx: broadcast::Sender<FleetEvent>,
}

impl EngineArgs {
    /// Arguments over in-process collaborators
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            config: Arc::new(config),
            collaborators: Collaborators::in_memory(),
            event_tx,
        }
    }
}

/// Actor owning the engine
pub struct EngineActor {
    engine: Engine,
}

impl EngineActor {
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.engine.subscribe()
    }
}

impl Actor for EngineActor {
    type Args = EngineArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "EngineActor starting");

        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel();
        let weak = actor_ref.downgrade();
        tokio::spawn(async move {
            while let Some(event) = loop_rx.recv().await {
                let Some(actor) = weak.upgrade() else {
                    break;
                };
                if actor.tell(Wake(event)).await.is_err() {
                    break;
                }
            }
            debug!("engine loop forwarder exiting");
        });

        let engine = Engine::new(args.config, args.collaborators, args.event_tx, loop_tx);
        Ok(Self { engine })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "EngineActor stopping");
        self.engine.shutdown();
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<CreateTransaction> for EngineActor {
    type Reply = Result<TransactionPostResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: CreateTransaction,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.create_transaction(msg.0).await
    }
}

impl Message<QueryTransaction> for EngineActor {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: QueryTransaction,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.query_transaction(&msg.id, msg.reply).await;
    }
}

impl Message<EndTransfer> for EngineActor {
    type Reply = Result<StatusResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: EndTransfer,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine
            .end_transfer(&msg.transaction_id, &msg.transfer_id)
            .await
    }
}

impl Message<ListTransactions> for EngineActor {
    type Reply = Result<Vec<RecordSummary>, CoreError>;

    async fn handle(
        &mut self,
        msg: ListTransactions,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.list_transactions(msg.code).await
    }
}

impl Message<DeleteTransaction> for EngineActor {
    type Reply = Result<StatusResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: DeleteTransaction,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.delete_transaction(&msg.id)
    }
}

impl Message<CreateTransfer> for EngineActor {
    type Reply = Result<TransferPostResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: CreateTransfer,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.create_transfer(msg.0).await
    }
}

impl Message<QueryTransfer> for EngineActor {
    type Reply = Result<TransferView, CoreError>;

    async fn handle(
        &mut self,
        msg: QueryTransfer,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.query_transfer(&msg.id).await
    }
}

impl Message<ReportTask> for EngineActor {
    type Reply = Result<StatusResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: ReportTask,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.report_task(&msg.transfer_id, msg.report).await
    }
}

impl Message<ListTransfers> for EngineActor {
    type Reply = Result<Vec<RecordSummary>, CoreError>;

    async fn handle(
        &mut self,
        msg: ListTransfers,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.list_transfers(msg.code).await
    }
}

impl Message<DeleteTransfer> for EngineActor {
    type Reply = Result<StatusResponse, CoreError>;

    async fn handle(
        &mut self,
        msg: DeleteTransfer,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.engine.delete_transfer(&msg.id)
    }
}

impl Message<Wake> for EngineActor {
    type Reply = ();

    async fn handle(&mut self, msg: Wake, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.engine.wake(msg.0).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Aggregate a transaction, giving up after `timeout`
///
/// # Errors
///
/// Returns `CoreError::Timeout` when the fan-out did not finish in time, or
/// the engine's error for unknown ids.
pub async fn query_transaction(
    actor: &ActorRef<EngineActor>,
    id: impl Into<String>,
    timeout: Duration,
) -> Result<TransactionView, CoreError> {
    let (reply, rx) = oneshot::channel();
    actor
        .ask(QueryTransaction {
            id: id.into(),
            reply,
        })
        .await
        .map_err(|e| CoreError::ActorError(e.to_string()))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CoreError::ActorError("query abandoned".to_string())),
        Err(_) => Err(CoreError::Timeout),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, BusError> {
    serde_json::from_value(payload).map_err(|e| BusError::Codec(e.to_string()))
}

fn encode<T, M>(reply: Result<T, SendError<M, CoreError>>) -> Result<Value, BusError>
where
    T: Serialize,
    SendError<M, CoreError>: std::fmt::Display,
{
    match reply {
        Ok(body) => serde_json::to_value(body).map_err(|e| BusError::Codec(e.to_string())),
        Err(SendError::HandlerError(e)) => Err(BusError::Remote {
            code: e.status_code(),
            message: e.to_string(),
        }),
        Err(e) => Err(BusError::Unreachable(e.to_string())),
    }
}

/// Serve the engine's tunnel and sync topics on an in-process bus
///
/// Every shard's tunnel and the sync side resolve to the same actor, which
/// makes a single process a complete deployment.
pub async fn mount(bus: &LocalBus, engine: &ActorRef<EngineActor>) {
    let actor = engine.clone();
    bus.register(
        "tunnel/*",
        topic::TRANSFER_POST,
        Arc::new(FnHandler::new(move |payload| {
            let actor = actor.clone();
            async move {
                let request: TransferPostRequest = decode(payload)?;
                encode(actor.ask(CreateTransfer(request)).await)
            }
        })),
    )
    .await;

    let actor = engine.clone();
    bus.register(
        "tunnel/*",
        topic::TRANSFER_GET,
        Arc::new(FnHandler::new(move |payload| {
            let actor = actor.clone();
            async move {
                let request: TransferGetRequest = decode(payload)?;
                encode(
                    actor
                        .ask(QueryTransfer {
                            id: request.transfer_id,
                        })
                        .await,
                )
            }
        })),
    )
    .await;

    let actor = engine.clone();
    bus.register(
        "tunnel/*",
        topic::TRANSFER_PUT,
        Arc::new(FnHandler::new(move |payload| {
            let actor = actor.clone();
            async move {
                let report: TransferPutRequest = decode(payload)?;
                encode(
                    actor
                        .ask(ReportTask {
                            transfer_id: report.transfer_id.clone(),
                            report,
                        })
                        .await,
                )
            }
        })),
    )
    .await;

    let actor = engine.clone();
    bus.register(
        "sync",
        topic::TRANSACTION_PUT,
        Arc::new(FnHandler::new(move |payload| {
            let actor = actor.clone();
            async move {
                let request: TransactionPutRequest = decode(payload)?;
                encode(
                    actor
                        .ask(EndTransfer {
                            transaction_id: request.transaction_id,
                            transfer_id: request.transfer_id,
                        })
                        .await,
                )
            }
        })),
    )
    .await;

    info!("engine mounted on local bus");
}
