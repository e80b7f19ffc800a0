//! Engine runtime: collaborators, timers and the event queues
//!
//! Everything that leaves the engine (bus calls, notifications, timers) runs
//! on a spawned tokio task and reports back as a [`LoopEvent`] over the loop
//! channel, so state is only ever touched by the task that owns the engine.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleetsync_api::events::FleetEvent;
use fleetsync_api::responses::{
    StatusResponse, TaskCommandResponse, TransferPostResponse, TransferView,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::bus::{BusError, Endpoint, LocalBus, MessageBus};
use crate::config::EngineConfig;
use crate::context::{Context, Kind, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::inventory::{HostInventory, StaticInventory};
use crate::notify::{LogNotifier, Notifier};
use crate::observer::{Fired, Signal};
use crate::registry::ServiceTable;
use crate::store::{DocumentStore, MemoryStore};
use crate::sync::TransactionModule;
use crate::tunnel::TransferModule;

/// Handle of a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Work delivered back to the engine
#[derive(Debug)]
pub enum LoopEvent {
    /// Enter the stage with `code` on `target`
    Advance {
        target: Target,
        code: i32,
        ctx: Context,
    },
    /// A timer elapsed; `event` runs unless the timer was cancelled
    Timer { id: TimerId, event: Box<LoopEvent> },
    /// An agent answered (or failed to answer) a task command
    TaskCalled {
        transfer: ObjectId,
        task: String,
        result: Result<TaskCommandResponse, BusError>,
    },
    /// Re-issue a task command after a failed call
    TaskRetry { transfer: ObjectId, task: String },
    /// A tunnel answered a transfer creation
    TransferPosted {
        transaction: ObjectId,
        bucket: String,
        result: Result<TransferPostResponse, BusError>,
    },
    /// A tunnel answered a transfer query
    TransferQueried {
        transaction: ObjectId,
        bucket: String,
        result: Result<TransferView, BusError>,
    },
    /// The sync side acknowledged a finished transfer
    FinishAcked {
        transfer: ObjectId,
        result: Result<StatusResponse, BusError>,
    },
    /// Archive notification delivered (or failed)
    Notified {
        transaction: ObjectId,
        result: Result<(), CoreError>,
    },
    /// Move a deleted entity from the live registry to the cache
    Retire(Target),
    /// Drop a cached entity
    Evict(Target),
}

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub bus: Arc<dyn MessageBus>,
    pub inventory: Arc<dyn HostInventory>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// In-process collaborators with an empty inventory
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(LocalBus::new()),
            inventory: Arc::new(StaticInventory::default()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Shared services and scheduling primitives of one engine
pub struct Runtime {
    /// Service locator for state managers and persistence modules
    pub services: ServiceTable,
    config: Arc<EngineConfig>,
    bus: Arc<dyn MessageBus>,
    inventory: Arc<dyn HostInventory>,
    notifier: Arc<dyn Notifier>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    event_tx: broadcast::Sender<FleetEvent>,
    timers: HashMap<TimerId, AbortHandle>,
    next_timer: u64,
    fired: VecDeque<Fired>,
    woken: VecDeque<LoopEvent>,
}

impl Runtime {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
        event_tx: broadcast::Sender<FleetEvent>,
        loop_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        let mut services = ServiceTable::new();
        services.insert(
            TransferModule::NAME,
            Arc::new(TransferModule::new(collaborators.store.clone())),
        );
        services.insert(
            TransactionModule::NAME,
            Arc::new(TransactionModule::new(collaborators.store)),
        );

        Self {
            services,
            config,
            bus: collaborators.bus,
            inventory: collaborators.inventory,
            notifier: collaborators.notifier,
            loop_tx,
            event_tx,
            timers: HashMap::new(),
            next_timer: 0,
            fired: VecDeque::new(),
            woken: VecDeque::new(),
        }
    }

    /// Runtime over in-memory collaborators, for unit tests
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);
        let rt = Self::new(
            Arc::new(EngineConfig::default()),
            Collaborators::in_memory(),
            event_tx,
            loop_tx,
        );
        (rt, loop_rx)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn inventory(&self) -> Arc<dyn HostInventory> {
        self.inventory.clone()
    }

    /// Persistence of transfers and tasks
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the module is not registered.
    pub fn tunnel_store(&self) -> Result<Arc<TransferModule>, CoreError> {
        self.services.require(TransferModule::NAME)
    }

    /// Persistence of transactions and their buckets
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the module is not registered.
    pub fn sync_store(&self) -> Result<Arc<TransactionModule>, CoreError> {
        self.services.require(TransactionModule::NAME)
    }

    /// Queue `event` for the current loop turn
    pub fn wake(&mut self, event: LoopEvent) {
        self.woken.push_back(event);
    }

    /// Deliver `event` after `delay`
    pub fn schedule_after(&mut self, delay: Duration, event: LoopEvent) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;

        let tx = self.loop_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopEvent::Timer {
                id,
                event: Box::new(event),
            });
        });

        debug!(timer = %id, delay_ms = delay.as_millis(), "timer scheduled");
        self.timers.insert(id, handle.abort_handle());
        id
    }

    /// Cancel a pending timer; an already delivered expiry is dropped on claim
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            debug!(timer = %id, "timer cancelled");
            handle.abort();
        }
    }

    /// Take ownership of an elapsed timer, `false` if it was cancelled
    pub fn claim(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Call `topic` on `endpoint`, reporting the decoded reply through `on_reply`
    pub fn call<T, F>(&self, endpoint: Endpoint, topic: &'static str, payload: Value, on_reply: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T, BusError>) -> LoopEvent + Send + 'static,
    {
        let bus = self.bus.clone();
        let tx = self.loop_tx.clone();
        debug!(endpoint = %endpoint, topic, "bus call issued");

        tokio::spawn(async move {
            let result = bus
                .call(&endpoint, topic, payload)
                .await
                .and_then(|reply| {
                    serde_json::from_value(reply).map_err(|e| BusError::Codec(e.to_string()))
                });
            let _ = tx.send(on_reply(result));
        });
    }

    /// Best-effort publication on `topic`
    pub fn publish(&self, topic: &'static str, payload: Value) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(topic, payload).await {
                warn!(topic, error = %e, "publish failed");
            }
        });
    }

    /// POST `body` to `url` through the notifier
    pub fn notify<F>(&self, url: String, body: Value, on_done: F)
    where
        F: FnOnce(Result<(), CoreError>) -> LoopEvent + Send + 'static,
    {
        let notifier = self.notifier.clone();
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let result = notifier.notify(&url, &body).await;
            let _ = tx.send(on_done(result));
        });
    }

    /// Queue `signal` of `kind` with `sender` as the firing entity
    pub fn fire(&mut self, kind: Kind, signal: Signal, sender: Target, mut ctx: Context) {
        ctx.sender = Some(sender);
        self.fired.push_back(Fired { kind, signal, ctx });
    }

    pub fn next_fired(&mut self) -> Option<Fired> {
        self.fired.pop_front()
    }

    pub fn next_woken(&mut self) -> Option<LoopEvent> {
        self.woken.pop_front()
    }

    /// Broadcast an engine event; nobody listening is fine
    pub fn emit(&self, event: FleetEvent) {
        let _ = self.event_tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.event_tx.subscribe()
    }

    /// Abort every pending timer
    pub fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_is_not_claimed() {
        let (mut rt, mut rx) = Runtime::detached();
        let kept = rt.schedule_after(
            Duration::from_secs(5),
            LoopEvent::Retire(Target::Transfer(ObjectId::new())),
        );
        let dropped = rt.schedule_after(
            Duration::from_secs(1),
            LoopEvent::Retire(Target::Transfer(ObjectId::new())),
        );
        rt.cancel(dropped);
        assert_eq!(rt.pending_timers(), 1);

        let Some(LoopEvent::Timer { id, event }) = rx.recv().await else {
            panic!("expected timer");
        };
        assert_eq!(id, kept);
        assert!(matches!(*event, LoopEvent::Retire(_)));
        assert!(rt.claim(id));
        assert!(!rt.claim(dropped));
    }

    #[tokio::test]
    async fn test_fire_binds_sender() {
        let (mut rt, _rx) = Runtime::detached();
        let target = Target::Transaction(ObjectId::new());
        rt.fire(
            Kind::Transaction,
            Signal::Queried,
            target.clone(),
            Context::default(),
        );

        let fired = rt.next_fired().unwrap();
        assert_eq!(fired.signal, Signal::Queried);
        assert_eq!(fired.ctx.sender, Some(target));
        assert!(rt.next_fired().is_none());
    }
}
