//! Status records, states and state managers
//!
//! A [`Status`] is the durable per-entity holder (code, message, current
//! stage, owning activity). A [`State`] is the behaviour bound to one stage of
//! one entity kind, and a [`StateManager`] is the per-kind stage table plus the
//! entry point for transitioning a status.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetsync_api::events::FleetEvent;
use tracing::{debug, error, info};

use crate::activity::Activity;
use crate::context::Context;
use crate::error::CoreError;
use crate::observer::EventRegistry;
use crate::runtime::{LoopEvent, Runtime, TimerId};

/// One lifecycle stage of an entity kind
pub trait Stage: Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Stage a fresh status enters when no stage is named
    const INITIAL: Self;

    /// Durable status code
    fn code(self) -> i32;

    /// Durable status message
    fn message(self) -> &'static str;

    /// Terminal stages never regress to earlier ones
    fn is_terminal(self) -> bool;

    fn from_code(code: i32) -> Option<Self>;
}

macro_rules! stages {
    (@terminal terminal) => { true };
    (@terminal) => { false };
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal => $message:literal $(, $terminal:ident)?;)+ } initial $initial:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl Stage for $name {
            const INITIAL: Self = Self::$initial;

            fn code(self) -> i32 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            fn message(self) -> &'static str {
                match self {
                    $(Self::$variant => $message),+
                }
            }

            fn is_terminal(self) -> bool {
                match self {
                    $(Self::$variant => stages!(@terminal $($terminal)?)),+
                }
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.message())
            }
        }
    };
}

stages! {
    /// Transaction lifecycle
    TransactionStage {
        Created = 0 => "TransactionCreated";
        Started = 1 => "TransactionStarted";
        Ended = 2 => "TransactionEnded";
        Finished = 3 => "TransactionFinished";
        Archived = 4 => "TransactionArchived", terminal;
        Deleted = 5 => "TransactionDeleted", terminal;
    } initial Created
}

stages! {
    /// Transfer lifecycle, shared by tunnel transfers and sync-side buckets
    TransferStage {
        Created = 10 => "TransferCreated";
        Started = 11 => "TransferStarted";
        Ended = 12 => "TransferEnded";
        Finished = 13 => "TransferFinished";
        Deleted = 14 => "TransferDeleted", terminal;
    } initial Created
}

stages! {
    /// Task lifecycle
    TaskStage {
        Created = 20 => "TransferTaskCreated";
        Sending = 21 => "TransferTaskSending";
        Sent = 22 => "TransferTaskSent";
        Ended = 23 => "TransferTaskEnded", terminal;
    } initial Created
}

/// Durable state holder of one entity
pub struct Status<A: Activity> {
    pub code: i32,
    pub message: String,
    /// Stage last entered, `None` before the first transition
    pub state: Option<A::Stage>,
    /// Pending watchdog guarding the current stage
    pub watchdog: Option<TimerId>,
    pub activity: A,
}

impl<A: Activity> Status<A> {
    #[must_use]
    pub fn new(activity: A) -> Self {
        Self {
            code: -1,
            message: String::new(),
            state: None,
            watchdog: None,
            activity,
        }
    }

    /// Record a new durable code and broadcast the change
    pub fn record(&mut self, code: i32, message: impl Into<String>, rt: &Runtime) {
        let message = message.into();
        let from = self.code;
        let id = self.activity.key();

        info!(
            kind = %A::KIND,
            id = %id,
            from,
            to = code,
            message = %message,
            "status changed"
        );

        rt.emit(FleetEvent::StageChanged {
            kind: A::KIND.as_str().to_string(),
            id,
            from,
            to: code,
            message: message.clone(),
        });

        self.code = code;
        self.message = message;
    }

    /// Record the code and message of `stage`
    pub fn record_stage(&mut self, stage: A::Stage, rt: &Runtime) {
        self.record(stage.code(), stage.message(), rt);
    }

    /// Collapse an activity result into a transition outcome, logging failures
    pub fn settle(&self, operation: &'static str, result: Result<bool, CoreError>) -> bool {
        match result {
            Ok(done) => done,
            Err(e) => {
                error!(
                    kind = %A::KIND,
                    id = %self.activity.key(),
                    operation,
                    error = %e,
                    "activity operation failed"
                );
                false
            }
        }
    }

    /// Settle `result` and move into `stage` when the operation succeeded
    pub fn conclude(
        &mut self,
        stage: A::Stage,
        operation: &'static str,
        result: Result<bool, CoreError>,
    ) -> bool {
        let done = self.settle(operation, result);
        if done {
            self.state = Some(stage);
        }
        done
    }
}

/// Follow-up arranged by a state after it was entered
pub enum Schedule<S> {
    /// Wait for an external event
    Idle,
    /// Enter `S` on the next loop turn
    Now(S),
    /// Enter `S` after a delay
    After(Duration, S),
    /// Enter `S` with `Context` unless the status leaves its stage first
    Watchdog(Duration, S, Context),
}

/// Behaviour bound to one stage of one entity kind
#[async_trait]
pub trait State<A: Activity>: Send + Sync {
    fn stage(&self) -> A::Stage;

    /// Perform the stage's domain action and report success
    async fn enter(&self, status: &mut Status<A>, ctx: &mut Context, rt: &mut Runtime) -> bool;

    /// Next automatic transition
    fn schedule(&self, _status: &Status<A>) -> Schedule<A::Stage> {
        Schedule::Idle
    }

    /// Whether a successful `enter` applies `schedule` right away
    fn auto_advance(&self) -> bool {
        false
    }
}

/// Stage table and event registry of one entity kind
pub struct StateManager<A: Activity> {
    states: BTreeMap<A::Stage, Arc<dyn State<A>>>,
    events: EventRegistry,
}

impl<A: Activity> Default for StateManager<A> {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
            events: EventRegistry::new(),
        }
    }
}

impl<A: Activity> StateManager<A> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self, state: Arc<dyn State<A>>) {
        self.states.insert(state.stage(), state);
    }

    #[must_use]
    pub fn state(&self, stage: A::Stage) -> Option<Arc<dyn State<A>>> {
        self.states.get(&stage).cloned()
    }

    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventRegistry {
        &mut self.events
    }

    /// Enter `stage`, defaulting to the current stage or the initial one
    ///
    /// Terminal stages never regress. A successful entry cancels the watchdog
    /// of the stage being left and applies the new stage's schedule when it
    /// advances on its own.
    pub async fn transition(
        &self,
        status: &mut Status<A>,
        stage: Option<A::Stage>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> bool {
        let stage = stage.or(status.state).unwrap_or(A::Stage::INITIAL);

        if status
            .state
            .is_some_and(|current| current.is_terminal() && stage < current)
        {
            debug!(
                kind = %A::KIND,
                id = %status.activity.key(),
                from = ?status.state,
                to = ?stage,
                "ignoring transition out of terminal stage"
            );
            return false;
        }

        let Some(state) = self.states.get(&stage).cloned() else {
            error!(kind = %A::KIND, stage = ?stage, "no state registered for stage");
            return false;
        };

        let guarded = status.watchdog;
        let entered = state.enter(status, ctx, rt).await;

        if entered {
            if let Some(timer) = guarded {
                if status.watchdog == Some(timer) {
                    rt.cancel(timer);
                    status.watchdog = None;
                }
            }
            if state.auto_advance() {
                self.advance(status, rt);
            }
        }

        entered
    }

    /// Apply the current stage's schedule
    pub fn advance(&self, status: &mut Status<A>, rt: &mut Runtime) {
        let Some(stage) = status.state else {
            return;
        };
        let Some(state) = self.states.get(&stage) else {
            return;
        };

        let target = status.activity.target();
        match state.schedule(status) {
            Schedule::Idle => {}
            Schedule::Now(next) => rt.wake(LoopEvent::Advance {
                target,
                code: next.code(),
                ctx: Context::default(),
            }),
            Schedule::After(delay, next) => {
                rt.schedule_after(
                    delay,
                    LoopEvent::Advance {
                        target,
                        code: next.code(),
                        ctx: Context::default(),
                    },
                );
            }
            Schedule::Watchdog(delay, next, ctx) => {
                if let Some(previous) = status.watchdog.take() {
                    rt.cancel(previous);
                }
                let timer = rt.schedule_after(
                    delay,
                    LoopEvent::Advance {
                        target,
                        code: next.code(),
                        ctx,
                    },
                );
                status.watchdog = Some(timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_tables() {
        assert_eq!(TransactionStage::INITIAL.code(), 0);
        assert_eq!(TransactionStage::Finished.code(), 3);
        assert!(TransactionStage::Archived.is_terminal());
        assert!(!TransactionStage::Finished.is_terminal());

        assert_eq!(TransferStage::from_code(12), Some(TransferStage::Ended));
        assert_eq!(TransferStage::from_code(15), None);
        assert!(TransferStage::Deleted.is_terminal());

        assert_eq!(TaskStage::Sent.message(), "TransferTaskSent");
        assert!(TaskStage::Ended.is_terminal());
        assert!(TaskStage::Sending < TaskStage::Sent);
    }

    #[test]
    fn test_codes_increase_along_each_table() {
        let transaction = [
            TransactionStage::Created,
            TransactionStage::Started,
            TransactionStage::Ended,
            TransactionStage::Finished,
            TransactionStage::Archived,
            TransactionStage::Deleted,
        ];
        assert!(transaction.windows(2).all(|w| w[0].code() < w[1].code()));

        let task = [
            TaskStage::Created,
            TaskStage::Sending,
            TaskStage::Sent,
            TaskStage::Ended,
        ];
        assert!(task.windows(2).all(|w| w[0].code() < w[1].code()));
    }
}
