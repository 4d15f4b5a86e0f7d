//! The mutation runtime: argument history and retry-latest on top of the
//! store.

use crate::context::{Context, ContextKey};
use crate::path::Path;
use crate::run_spec::AutomaticRunningKey;
use crate::sources::{Diagnostic, DiagnosticReporterKey};
use crate::state::{
    OperationIntent, OperationKind, OperationState, ResultUpdateReasonKey, UpdateReason,
    UpdateStamps,
};
use crate::store::{Operation, OperationContinuation, OperationStore, RunResult};
use crate::task::{OperationTask, TaskError, TaskHandle, TaskId};
use crate::time::ClockKey;
use crate::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Failures of the mutation entry points.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MutateError<E> {
    /// `retry_latest` was called before any `mutate`.
    #[error("retry_latest requires a previous mutate call")]
    NoPreviousArguments,
    /// The underlying task failed or was cancelled.
    #[error("the underlying task failed")]
    Task(TaskError<E>),
}

impl<E> From<TaskError<E>> for MutateError<E> {
    fn from(error: TaskError<E>) -> Self {
        MutateError::Task(error)
    }
}

/// The mutation intent space: every `mutate` call is its own intent
/// (arguments have identity, not equality), while retry-latest is a single
/// deduplicated intent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MutationIntent {
    /// One `mutate` invocation, numbered in call order.
    Mutate(u64),
    /// Re-run with the most recently used arguments.
    RetryLatest,
}

impl OperationIntent for MutationIntent {
    fn default_intent() -> Self {
        MutationIntent::RetryLatest
    }

    fn label(&self) -> &'static str {
        match self {
            MutationIntent::Mutate(_) => "mutate",
            MutationIntent::RetryLatest => "retry latest",
        }
    }
}

/// Context key carrying the arguments of the mutation intent being
/// executed.
pub struct MutationArgumentsKey<A>(PhantomData<A>);

impl<A: Clone + Send + Sync + fmt::Debug + 'static> ContextKey for MutationArgumentsKey<A> {
    type Value = Option<A>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "MutationArguments"
    }
}

/// Context key carrying the history serial of the mutation intent being
/// executed.
pub struct MutationSerialKey;

impl ContextKey for MutationSerialKey {
    type Value = Option<u64>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "MutationSerial"
    }
}

/// Context key capping the mutation history length. `None` means
/// unbounded; when set, the oldest entries are discarded first.
pub struct HistoryLimitKey;

impl ContextKey for HistoryLimitKey {
    type Value = Option<usize>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "HistoryLimit"
    }
}

/// One attempt in a mutation's history.
#[derive(Clone, Debug)]
pub struct MutationAttempt<A, V, E> {
    serial: u64,
    /// The arguments the attempt ran with.
    pub arguments: A,
    /// The attempt's result; `None` while it is still running.
    pub result: Option<Result<V, E>>,
    /// When the attempt began.
    pub started_at: Instant,
    /// When the attempt finished; `None` while it is still running.
    pub ended_at: Option<Instant>,
}

/// Subscriber events specific to mutations.
#[derive(Clone, Debug)]
pub enum MutationEvent<A, V, E> {
    /// A mutation began executing.
    MutatingStarted {
        /// The arguments it runs with.
        arguments: A,
    },
    /// A mutation produced a result.
    ResultReceived {
        /// The arguments it ran with.
        arguments: A,
        /// The output or the failure.
        result: Result<V, E>,
    },
    /// A mutation finished executing.
    MutatingEnded {
        /// The arguments it ran with.
        arguments: A,
    },
}

/// State of a mutation operation.
#[derive(Clone)]
pub struct MutationState<A, V, E> {
    last_value: Option<V>,
    history: Vec<MutationAttempt<A, V, E>>,
    error: Option<E>,
    stamps: UpdateStamps,
    active_pending: Vec<TaskHandle>,
    active_retry: Vec<TaskHandle>,
    next_serial: u64,
}

impl<A, V, E> MutationState<A, V, E>
where
    A: Clone,
{
    /// A fresh state with no history.
    pub fn new() -> Self {
        MutationState {
            last_value: None,
            history: Vec::new(),
            error: None,
            stamps: UpdateStamps::default(),
            active_pending: Vec::new(),
            active_retry: Vec::new(),
            next_serial: 0,
        }
    }

    /// The output of the most recently completed successful mutation.
    pub fn last_value(&self) -> Option<&V> {
        self.last_value.as_ref()
    }

    /// Every attempt, in start order.
    pub fn history(&self) -> &[MutationAttempt<A, V, E>] {
        &self.history
    }

    /// The arguments of the most recent attempt.
    pub fn last_arguments(&self) -> Option<A> {
        self.history.last().map(|attempt| attempt.arguments.clone())
    }

    pub(crate) fn allocate_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    pub(crate) fn begin_attempt(&mut self, serial: u64, arguments: A, started_at: Instant) {
        // Retries re-enter the body with the same serial; the history
        // records one entry per mutate call, not per attempt.
        if self.history.iter().any(|attempt| attempt.serial == serial) {
            return;
        }
        self.history.push(MutationAttempt {
            serial,
            arguments,
            result: None,
            started_at,
            ended_at: None,
        });
    }

    fn finish_attempt(&mut self, serial: u64, result: Result<V, E>, ended_at: Instant)
    where
        V: Clone,
        E: Clone,
    {
        if let Some(attempt) = self
            .history
            .iter_mut()
            .rev()
            .find(|attempt| attempt.serial == serial)
        {
            attempt.result = Some(result);
            attempt.ended_at = Some(ended_at);
        }
    }
}

impl<A: Clone, V, E> Default for MutationState<A, V, E> {
    fn default() -> Self {
        MutationState::new()
    }
}

impl<A, V, E> OperationState for MutationState<A, V, E>
where
    A: Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Value = V;
    type RunOutput = V;
    type Failure = E;
    type Intent = MutationIntent;
    type Event = MutationEvent<A, V, E>;

    const KIND: OperationKind = OperationKind::Mutation;

    fn current_value(&self) -> Option<&V> {
        self.last_value.as_ref()
    }

    fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    fn stamps(&self) -> &UpdateStamps {
        &self.stamps
    }

    fn update_from(&mut self, result: &Result<V, E>, context: &Context) {
        let now = context.get::<ClockKey>().now();
        if let Some(serial) = context.get::<MutationSerialKey>() {
            self.finish_attempt(serial, result.clone(), now);
        }
        if let Some(limit) = context.get::<HistoryLimitKey>() {
            while self.history.len() > limit {
                self.history.remove(0);
            }
        }
        match result {
            Ok(value) => {
                self.last_value = Some(value.clone());
                if context.get::<ResultUpdateReasonKey>() == UpdateReason::ReturnedFinalResult {
                    self.error = None;
                }
                self.stamps.record_value(now);
            }
            Err(error) => {
                self.error = Some(error.clone());
                self.stamps.record_error(now);
            }
        }
    }

    fn task_scheduled(&mut self, intent: &MutationIntent, task: TaskHandle) {
        match intent {
            MutationIntent::Mutate(_) => self.active_pending.push(task),
            MutationIntent::RetryLatest => self.active_retry.push(task),
        }
    }

    fn task_settled(&mut self, intent: &MutationIntent, task: TaskId) {
        let tasks = match intent {
            MutationIntent::Mutate(_) => &mut self.active_pending,
            MutationIntent::RetryLatest => &mut self.active_retry,
        };
        tasks.retain(|active| active.id() != task);
    }

    fn active_tasks(&self) -> Vec<TaskHandle> {
        self.active_pending
            .iter()
            .chain(&self.active_retry)
            .cloned()
            .collect()
    }
}

impl<A, V, E> fmt::Debug for MutationState<A, V, E>
where
    A: fmt::Debug,
    V: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("MutationState")
            .field("last_value", &self.last_value)
            .field("history", &self.history.len())
            .field("error", &self.error)
            .field("stamps", &self.stamps)
            .finish()
    }
}

/// A descriptor for a side-effecting operation taking arguments.
pub trait MutationOperation: Send + Sync + 'static {
    /// The argument type of one mutation.
    type Arguments: Clone + Send + Sync + fmt::Debug + 'static;
    /// The mutation's output.
    type Output: Clone + Send + Sync + 'static;
    /// The mutation's failure type.
    type Failure: Clone + Send + Sync + 'static;

    /// The operation's identity.
    fn path(&self) -> Path;

    /// Performs the mutation. Interim outputs may be streamed through
    /// `continuation`.
    fn mutate(
        self: Arc<Self>,
        arguments: Self::Arguments,
        context: Context,
        continuation: OperationContinuation<
            MutationState<Self::Arguments, Self::Output, Self::Failure>,
        >,
    ) -> BoxFuture<'static, Result<Self::Output, Self::Failure>>;

    /// Adjusts the context a store for this operation is created with.
    fn setup(&self, context: &mut Context) {
        let _ = context;
    }
}

type MutationStateOf<Op> = MutationState<
    <Op as MutationOperation>::Arguments,
    <Op as MutationOperation>::Output,
    <Op as MutationOperation>::Failure,
>;

/// Lifts a [`MutationOperation`] into an [`Operation`] driving a
/// [`MutationState`].
pub struct Mutating<Op> {
    operation: Arc<Op>,
}

impl<Op: MutationOperation> Mutating<Op> {
    /// Wraps `operation`.
    pub fn new(operation: Op) -> Self {
        Mutating {
            operation: Arc::new(operation),
        }
    }
}

impl<Op: MutationOperation> Operation for Mutating<Op> {
    type State = MutationStateOf<Op>;

    fn path(&self) -> Path {
        self.operation.path()
    }

    fn initial_state(&self) -> Self::State {
        MutationState::new()
    }

    fn setup(&self, context: &mut Context) {
        // Mutations never run without arguments, so they are excluded from
        // automatic running regardless of the client's defaults.
        context.insert::<AutomaticRunningKey>(false);
        self.operation.setup(context);
    }

    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Self::State>,
    ) -> BoxFuture<'static, RunResult<Self::State>> {
        let operation = self.operation.clone();
        async move {
            let arguments = match context.get::<MutationArgumentsKey<Op::Arguments>>() {
                Some(arguments) => arguments,
                None => panic!(
                    "a mutation store cannot run without arguments; \
                     use mutate() or retry_latest()"
                ),
            };
            let serial = context
                .get::<MutationSerialKey>()
                .expect("mutation tasks always carry a history serial");

            let started_at = context.get::<ClockKey>().now();
            continuation.with_store(|store| {
                store.with_inner(|inner| {
                    inner.state.begin_attempt(serial, arguments.clone(), started_at);
                    store.queue_state_changed(inner);
                });
                store.drain();
            });
            continuation.emit(MutationEvent::MutatingStarted {
                arguments: arguments.clone(),
            });

            let result = operation
                .clone()
                .mutate(arguments.clone(), context.clone(), continuation.clone())
                .await;

            continuation.emit(MutationEvent::ResultReceived {
                arguments: arguments.clone(),
                result: result.clone(),
            });
            continuation.emit(MutationEvent::MutatingEnded { arguments });
            result
        }
        .boxed()
    }
}

impl<A, V, E> crate::store::EventHandler<MutationState<A, V, E>>
where
    A: Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Invoked when a mutation begins executing.
    pub fn on_mutating_started(self, f: impl Fn(&A, &Context) + Send + Sync + 'static) -> Self {
        self.on_operation_event(move |event, context| {
            if let MutationEvent::MutatingStarted { arguments } = event {
                f(arguments, context);
            }
        })
    }

    /// Invoked for every mutation result.
    pub fn on_mutation_result_received(
        self,
        f: impl Fn(&A, &Result<V, E>, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.on_operation_event(move |event, context| {
            if let MutationEvent::ResultReceived { arguments, result } = event {
                f(arguments, result, context);
            }
        })
    }

    /// Invoked when a mutation finishes executing.
    pub fn on_mutating_ended(self, f: impl Fn(&A, &Context) + Send + Sync + 'static) -> Self {
        self.on_operation_event(move |event, context| {
            if let MutationEvent::MutatingEnded { arguments } = event {
                f(arguments, context);
            }
        })
    }
}

impl<A, V, E> OperationStore<MutationState<A, V, E>>
where
    A: Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Runs the mutation with `arguments` and awaits its output. Every
    /// call is its own intent: two concurrent `mutate` calls never share a
    /// task, even with equal arguments.
    pub async fn mutate(&self, arguments: A) -> Result<V, TaskError<E>> {
        self.mutate_task(arguments).run_if_needed().await
    }

    /// Like [`mutate`](Self::mutate), but returns the task without
    /// awaiting it.
    pub fn mutate_task(&self, arguments: A) -> OperationTask<V, E> {
        let task = self.with_inner(|inner| {
            let serial = inner.state.allocate_serial();
            let mut context = inner.context.clone();
            context.insert::<MutationArgumentsKey<A>>(Some(arguments.clone()));
            context.insert::<MutationSerialKey>(Some(serial));
            self.spawn_intent_locked(inner, MutationIntent::Mutate(serial), Some(context), false)
        });
        self.drain();
        task
    }

    /// Re-runs the mutation with the most recently used arguments,
    /// joining an in-flight retry. Fails with
    /// [`MutateError::NoPreviousArguments`] when nothing was ever mutated.
    pub async fn retry_latest(&self) -> Result<V, MutateError<E>> {
        let task = self.with_inner(|inner| {
            let arguments = inner.state.last_arguments()?;
            let serial = inner.state.allocate_serial();
            let mut context = inner.context.clone();
            context.insert::<MutationArgumentsKey<A>>(Some(arguments));
            context.insert::<MutationSerialKey>(Some(serial));
            Some(self.spawn_intent_locked(
                inner,
                MutationIntent::RetryLatest,
                Some(context),
                false,
            ))
        });
        self.drain();

        match task {
            None => {
                let context = self.context();
                context
                    .get::<DiagnosticReporterKey>()
                    .report(&Diagnostic::RetryLatestWithoutHistory {
                        path: self.path().clone(),
                    });
                Err(MutateError::NoPreviousArguments)
            }
            Some(task) => Ok(task.run_if_needed().await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type State = MutationState<String, u32, String>;

    #[test]
    fn history_records_and_finishes_attempts() {
        let mut context = Context::new();
        let mut state = State::new();
        let now = Instant::now();

        let serial = state.allocate_serial();
        state.begin_attempt(serial, "x".to_owned(), now);
        assert_eq!(state.history().len(), 1);
        assert!(state.history()[0].result.is_none());
        assert_eq!(state.last_arguments(), Some("x".to_owned()));

        context.insert::<MutationSerialKey>(Some(serial));
        state.update_from(&Ok(5), &context);
        let attempt = &state.history()[0];
        assert_eq!(attempt.result, Some(Ok(5)));
        assert!(attempt.ended_at.is_some());
        assert_eq!(state.last_value(), Some(&5));
        assert_eq!(state.stamps().value_update_count(), 1);
    }

    #[test]
    fn history_cap_discards_oldest_entries() {
        let mut context = Context::new();
        context.insert::<HistoryLimitKey>(Some(2));
        let mut state = State::new();
        let now = Instant::now();

        for i in 0..4 {
            let serial = state.allocate_serial();
            state.begin_attempt(serial, format!("arg-{i}"), now);
            context.insert::<MutationSerialKey>(Some(serial));
            state.update_from(&Ok(i), &context);
        }
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.history()[0].arguments, "arg-2");
        assert_eq!(state.history()[1].arguments, "arg-3");
    }

    #[test]
    fn failed_attempts_keep_the_error() {
        let mut context = Context::new();
        let mut state = State::new();
        let serial = state.allocate_serial();
        state.begin_attempt(serial, "x".to_owned(), Instant::now());
        context.insert::<MutationSerialKey>(Some(serial));

        state.update_from(&Err("denied".to_owned()), &context);
        assert_eq!(state.error(), Some(&"denied".to_owned()));
        assert_eq!(state.history()[0].result, Some(Err("denied".to_owned())));
        assert!(state.last_value().is_none());
    }
}
