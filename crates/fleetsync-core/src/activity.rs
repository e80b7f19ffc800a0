//! Activity lifecycle protocol
//!
//! Transactions, buckets, transfers and tasks share one lifecycle interface.
//! Kinds implement only the operations meaningful to them; the rest report
//! [`CoreError::Unsupported`] so callers can tell "not applicable" apart from
//! "failed".

use async_trait::async_trait;

use crate::context::{Context, Kind, Target};
use crate::error::CoreError;
use crate::runtime::Runtime;
use crate::state::{Stage, Status};

/// Refuse `operation` on behalf of the kind of `A`
pub(crate) fn unsupported<A: Activity, T>(operation: &'static str) -> Result<T, CoreError> {
    Err(CoreError::Unsupported {
        kind: A::KIND.as_str(),
        operation,
    })
}

/// Behaviour object bound to a [`Status`]
#[async_trait]
pub trait Activity: Sized + Send + Sync + 'static {
    type Stage: Stage;

    const KIND: Kind;

    /// Correlation key, provisional until the entity is persisted
    fn key(&self) -> String;

    /// Engine address of this entity
    fn target(&self) -> Target;

    /// Persist the entity and build its children
    async fn create(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("create")
    }

    /// Begin processing
    async fn start(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("start")
    }

    /// Issue the remote call
    async fn send(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("send")
    }

    /// Acknowledge the remote call round trip
    async fn recv(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("recv")
    }

    /// Accept a completion or count a child completion
    async fn end(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("end")
    }

    /// Report completion upwards
    async fn finish(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("finish")
    }

    /// Hand the final view to the original caller
    async fn archive(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("archive")
    }

    /// Release the entity from the live registry
    async fn delete(
        _status: &mut Status<Self>,
        _ctx: &mut Context,
        _rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        unsupported::<Self, _>("delete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::state::TransactionStage;

    struct Stub(ObjectId);

    impl Activity for Stub {
        type Stage = TransactionStage;

        const KIND: Kind = Kind::Transaction;

        fn key(&self) -> String {
            self.0.to_string()
        }

        fn target(&self) -> Target {
            Target::Transaction(self.0)
        }
    }

    #[tokio::test]
    async fn test_default_operations_are_unsupported() {
        let (mut rt, _rx) = Runtime::detached();
        let mut status = Status::new(Stub(ObjectId::new()));
        let mut ctx = Context::default();

        let err = Stub::archive(&mut status, &mut ctx, &mut rt)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::Unsupported {
                kind: "transaction",
                operation: "archive"
            }
        );
        assert!(Stub::send(&mut status, &mut ctx, &mut rt).await.is_err());
    }

    #[test]
    fn test_refusal_names_the_kind() {
        let err = unsupported::<Stub, ()>("delete").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err,
            CoreError::Unsupported {
                kind: "transaction",
                operation: "delete"
            }
        );
    }
}
