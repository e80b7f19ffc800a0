//! Event registry
//!
//! Every entity kind owns one registry mapping a lifecycle signal to at most
//! one handler. Firing a signal queues it on the runtime; the engine later
//! invokes the handler with the firing entity bound as `sender`, then runs the
//! signal's default body. Cross-layer propagation (task to transfer, bucket to
//! transaction) is wired once at startup from explicit `(signal, slot)` lists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::context::{Context, Kind};
use crate::engine::Engine;

/// Lifecycle signals an activity can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Created,
    Started,
    Sent,
    Received,
    Ended,
    Finished,
    Archived,
    Deleted,
    Queried,
    Error,
}

impl Signal {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "on_create",
            Self::Started => "on_start",
            Self::Sent => "on_send",
            Self::Received => "on_recv",
            Self::Ended => "on_end",
            Self::Finished => "on_finish",
            Self::Archived => "on_archive",
            Self::Deleted => "on_delete",
            Self::Queried => "on_query",
            Self::Error => "on_error",
        }
    }

    /// Body that runs after the registered handler, if any
    pub fn default_body(self, kind: Kind, ctx: &Context) {
        trace!(
            kind = %kind,
            signal = self.as_str(),
            sender = ?ctx.sender,
            "signal delivered"
        );
    }
}

/// Handler invoked when a wired signal fires
#[async_trait]
pub trait Slot: Send + Sync {
    /// Handle a signal; `ctx.sender` names the firing entity
    async fn complete(&self, engine: &mut Engine, ctx: &mut Context);
}

/// Signal to handler mapping of one entity kind
#[derive(Default, Clone)]
pub struct EventRegistry {
    handlers: HashMap<Signal, Arc<dyn Slot>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slot` for `signal`, returning the handler it replaced
    pub fn register(&mut self, signal: Signal, slot: Arc<dyn Slot>) -> Option<Arc<dyn Slot>> {
        self.handlers.insert(signal, slot)
    }

    /// Handler registered for `signal`
    #[must_use]
    pub fn slot(&self, signal: Signal) -> Option<Arc<dyn Slot>> {
        self.handlers.get(&signal).cloned()
    }

    #[must_use]
    pub fn is_wired(&self, signal: Signal) -> bool {
        self.handlers.contains_key(&signal)
    }
}

/// A queued signal awaiting delivery
#[derive(Debug, Clone)]
pub struct Fired {
    pub kind: Kind,
    pub signal: Signal,
    pub ctx: Context,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Slot for Noop {
        async fn complete(&self, _engine: &mut Engine, _ctx: &mut Context) {}
    }

    #[test]
    fn test_register_overwrites() {
        let mut registry = EventRegistry::new();
        assert!(!registry.is_wired(Signal::Ended));

        let first: Arc<dyn Slot> = Arc::new(Noop);
        assert!(registry.register(Signal::Ended, first.clone()).is_none());

        let replaced = registry.register(Signal::Ended, Arc::new(Noop));
        assert!(replaced.is_some_and(|slot| Arc::ptr_eq(&slot, &first)));
        assert!(registry.is_wired(Signal::Ended));
        assert!(registry.slot(Signal::Created).is_none());
    }
}
