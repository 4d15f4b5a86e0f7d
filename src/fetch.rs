//! Single-value operations.

use crate::context::Context;
use crate::path::Path;
use crate::state::SingleState;
use crate::store::{Operation, OperationContinuation, RunResult};
use crate::BoxFuture;
use std::sync::Arc;

/// A descriptor for an operation producing one value per run.
pub trait FetchOperation: Send + Sync + 'static {
    /// The fetched value.
    type Value: Clone + Send + Sync + 'static;
    /// The failure type of a fetch.
    type Failure: Clone + Send + Sync + 'static;

    /// The operation's identity.
    fn path(&self) -> Path;

    /// Performs one fetch attempt. Interim values may be streamed through
    /// `continuation`.
    fn fetch(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<SingleState<Self::Value, Self::Failure>>,
    ) -> BoxFuture<'static, Result<Self::Value, Self::Failure>>;

    /// Adjusts the context a store for this operation is created with.
    fn setup(&self, context: &mut Context) {
        let _ = context;
    }
}

/// Lifts a [`FetchOperation`] into an [`Operation`] driving a
/// [`SingleState`].
pub struct Single<Op> {
    operation: Arc<Op>,
}

impl<Op: FetchOperation> Single<Op> {
    /// Wraps `operation`.
    pub fn new(operation: Op) -> Self {
        Single {
            operation: Arc::new(operation),
        }
    }
}

impl<Op: FetchOperation> Operation for Single<Op> {
    type State = SingleState<Op::Value, Op::Failure>;

    fn path(&self) -> Path {
        self.operation.path()
    }

    fn initial_state(&self) -> Self::State {
        SingleState::new()
    }

    fn setup(&self, context: &mut Context) {
        self.operation.setup(context);
    }

    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Self::State>,
    ) -> BoxFuture<'static, RunResult<Self::State>> {
        self.operation.clone().fetch(context, continuation)
    }
}
