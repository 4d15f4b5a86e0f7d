//! The per-operation state machine.
//!
//! An [`OperationStore`] owns one operation's state, coordinates the tasks
//! that execute it, deduplicates in-flight work per intent, applies the
//! retry loop, and fans results out to subscribers. Stores are shared by
//! reference: every caller asking the client for the same path gets a
//! handle to the same store.
//!
//! Locking: the store's critical section is a recursive mutex wrapping a
//! `RefCell`, so controller callbacks issued from inside a store mutation
//! can re-enter the store on the same thread. Inner borrows are only ever
//! held across crate code; subscriber callbacks are dispatched from an
//! ordered outbox with every lock released.

use crate::backoff::{BackoffKey, MaxRetriesKey, RetryIndexKey};
use crate::context::{Context, ContextKey};
use crate::path::Path;
use crate::run_spec::{AutomaticRunningKey, RunSpecification, RunSpecificationsKey};
use crate::sources::{AlertMessage, AlertSinkKey};
use crate::state::{
    OperationIntent, OperationState, OperationStatus, ResultUpdateReasonKey, UpdateReason,
};
use crate::subscription::Subscription;
use crate::task::{
    OperationTask, TaskConfiguration, TaskError, TaskId, TaskNameKey, TaskOutcome,
};
use crate::time::DelayerKey;
use crate::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// The result of one executed intent, before task-level failures
/// (cancellation) are folded in.
pub type RunResult<S> =
    Result<<S as OperationState>::RunOutput, <S as OperationState>::Failure>;

/// Shorthand for an operation's run-output type.
pub type RunOutputOf<Op> = <<Op as Operation>::State as OperationState>::RunOutput;

/// Shorthand for an operation's failure type.
pub type FailureOf<Op> = <<Op as Operation>::State as OperationState>::Failure;

/// A descriptor for an asynchronous computation with a stable [`Path`]
/// identity.
///
/// Operations are pure values; all live state belongs to the store. The
/// state type discriminates the operation kind: single-value, paginated or
/// mutation. Most code implements one of the kind-specific traits
/// ([`FetchOperation`](crate::FetchOperation),
/// [`PaginatedOperation`](crate::PaginatedOperation),
/// [`MutationOperation`](crate::MutationOperation)) and wraps it; this
/// trait is the common denominator the store executes.
pub trait Operation: Send + Sync + 'static {
    /// The state variant this operation drives.
    type State: OperationState;

    /// The operation's identity.
    fn path(&self) -> Path;

    /// The state a fresh (or reset) store starts from.
    fn initial_state(&self) -> Self::State;

    /// Adjusts the context a store for this operation is created with.
    /// Modifiers layer their context writes here.
    fn setup(&self, context: &mut Context) {
        let _ = context;
    }

    /// Executes one attempt of one intent. Interim values may be streamed
    /// through `continuation`; the returned result is the attempt's final
    /// outcome.
    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Self::State>,
    ) -> BoxFuture<'static, RunResult<Self::State>>;
}

/// Object-safe face of [`Operation`] the store holds once the concrete
/// operation type has been erased.
pub(crate) trait DynOperation<S: OperationState>: Send + Sync + 'static {
    fn initial_state(&self) -> S;
    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<S>,
    ) -> BoxFuture<'static, RunResult<S>>;
}

impl<Op: Operation> DynOperation<Op::State> for Op {
    fn initial_state(&self) -> Op::State {
        Operation::initial_state(self)
    }

    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Op::State>,
    ) -> BoxFuture<'static, RunResult<Op::State>> {
        Operation::run(self, context, continuation)
    }
}

/// Decides whether a failed attempt is eligible for retry.
#[derive(Clone)]
pub struct RetryPredicate<E>(Arc<dyn Fn(&E) -> bool + Send + Sync>);

impl<E> RetryPredicate<E> {
    /// Retries when `predicate` accepts the error.
    pub fn new(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        RetryPredicate(Arc::new(predicate))
    }

    /// True when the error should be retried.
    pub fn should_retry(&self, error: &E) -> bool {
        (self.0)(error)
    }
}

impl<E> fmt::Debug for RetryPredicate<E> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "<retry predicate>")
    }
}

/// Context key for the retry policy's error predicate. Defaults to
/// retrying every failure.
pub struct RetryPredicateKey<E>(PhantomData<E>);

impl<E: Clone + Send + Sync + 'static> ContextKey for RetryPredicateKey<E> {
    type Value = RetryPredicate<E>;

    fn default_value() -> Self::Value {
        RetryPredicate::new(|_| true)
    }

    fn name() -> &'static str {
        "RetryPredicate"
    }
}

/// Context key deciding whether in-flight tasks are shared per intent.
pub struct DeduplicationKey;

impl ContextKey for DeduplicationKey {
    type Value = bool;

    fn default_value() -> bool {
        true
    }

    fn name() -> &'static str {
        "Deduplication"
    }
}

/// Alert messages the store posts on terminal results.
#[derive(Clone, Debug, Default)]
pub struct AlertConfiguration {
    /// Posted on a terminal success.
    pub success: Option<AlertMessage>,
    /// Posted on a final-attempt failure (never on cancellation).
    pub failure: Option<AlertMessage>,
}

/// Context key for the alerts modifier's configuration.
pub struct AlertsKey;

impl ContextKey for AlertsKey {
    type Value = AlertConfiguration;

    fn default_value() -> AlertConfiguration {
        AlertConfiguration::default()
    }

    fn name() -> &'static str {
        "Alerts"
    }
}

/// An external driver that may inject yields and schedule re-runs into a
/// store. Installed through the `controlled_by` modifier; the store hands
/// it an [`OperationControls`] when it is created.
pub trait OperationController<S: OperationState>: Send + Sync + 'static {
    /// Starts controlling. The returned subscription is retained by the
    /// store and cancelled when the store is dropped.
    fn control(&self, controls: OperationControls<S>) -> Subscription;
}

/// The controllers installed on an operation's context.
pub struct Controllers<S>(Vec<Arc<dyn OperationController<S>>>);

impl<S> Controllers<S> {
    /// Adds a controller.
    pub fn push(&mut self, controller: Arc<dyn OperationController<S>>) {
        self.0.push(controller);
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn OperationController<S>>> {
        self.0.iter()
    }
}

impl<S> Default for Controllers<S> {
    fn default() -> Self {
        Controllers(Vec::new())
    }
}

impl<S> Clone for Controllers<S> {
    fn clone(&self) -> Self {
        Controllers(self.0.clone())
    }
}

impl<S> fmt::Debug for Controllers<S> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "<{} controllers>", self.0.len())
    }
}

/// Context key for the controllers to install on store creation.
pub struct ControllersKey<S>(PhantomData<S>);

impl<S: OperationState> ContextKey for ControllersKey<S> {
    type Value = Controllers<S>;

    fn default_value() -> Controllers<S> {
        Controllers::default()
    }

    fn name() -> &'static str {
        "Controllers"
    }
}

enum StoreEvent<S: OperationState> {
    StateChanged { state: S, context: Context },
    FetchingStarted { context: Context },
    FetchingEnded { context: Context },
    ResultReceived { result: RunResult<S>, context: Context },
    Operation { event: S::Event, context: Context },
}

struct QueuedEvent<S: OperationState> {
    /// Restricts delivery to one subscriber (the initial attach event).
    target: Option<u64>,
    event: StoreEvent<S>,
}

type StateCallback<S> = Box<dyn Fn(&S, &Context) + Send + Sync>;
type ContextCallback = Box<dyn Fn(&Context) + Send + Sync>;
type ResultCallback<S> = Box<dyn Fn(&RunResult<S>, &Context) + Send + Sync>;
type EventCallback<S> = Box<dyn Fn(&<S as OperationState>::Event, &Context) + Send + Sync>;

/// A bundle of subscriber callbacks.
///
/// All callbacks are invoked with the store's lock released, in the order
/// the store produced the events. They must not block; long work should be
/// dispatched elsewhere.
pub struct EventHandler<S: OperationState> {
    state_changed: Vec<StateCallback<S>>,
    fetching_started: Vec<ContextCallback>,
    fetching_ended: Vec<ContextCallback>,
    result_received: Vec<ResultCallback<S>>,
    events: Vec<EventCallback<S>>,
}

impl<S: OperationState> EventHandler<S> {
    /// A handler with no callbacks.
    pub fn new() -> Self {
        EventHandler {
            state_changed: Vec::new(),
            fetching_started: Vec::new(),
            fetching_ended: Vec::new(),
            result_received: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Invoked with a state snapshot after every state transition, and
    /// once on attach.
    pub fn on_state_changed(mut self, f: impl Fn(&S, &Context) + Send + Sync + 'static) -> Self {
        self.state_changed.push(Box::new(f));
        self
    }

    /// Invoked when an intent begins executing.
    pub fn on_fetching_started(mut self, f: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.fetching_started.push(Box::new(f));
        self
    }

    /// Invoked when an intent finishes executing.
    pub fn on_fetching_ended(mut self, f: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.fetching_ended.push(Box::new(f));
        self
    }

    /// Invoked for every recorded result. The context's
    /// [`ResultUpdateReasonKey`] distinguishes yields from final results.
    pub fn on_result_received(
        mut self,
        f: impl Fn(&RunResult<S>, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.result_received.push(Box::new(f));
        self
    }

    /// Invoked for variant-specific events (page fetches, mutations).
    pub fn on_operation_event(
        mut self,
        f: impl Fn(&S::Event, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.events.push(Box::new(f));
        self
    }

    fn dispatch(&self, event: &StoreEvent<S>) {
        match event {
            StoreEvent::StateChanged { state, context } => {
                for callback in &self.state_changed {
                    callback(state, context);
                }
            }
            StoreEvent::FetchingStarted { context } => {
                for callback in &self.fetching_started {
                    callback(context);
                }
            }
            StoreEvent::FetchingEnded { context } => {
                for callback in &self.fetching_ended {
                    callback(context);
                }
            }
            StoreEvent::ResultReceived { result, context } => {
                for callback in &self.result_received {
                    callback(result, context);
                }
            }
            StoreEvent::Operation { event, context } => {
                for callback in &self.events {
                    callback(event, context);
                }
            }
        }
    }
}

impl<S: OperationState> Default for EventHandler<S> {
    fn default() -> Self {
        EventHandler::new()
    }
}

pub(crate) struct StoreInner<S: OperationState> {
    pub(crate) state: S,
    pub(crate) context: Context,
    pub(crate) tasks: FxHashMap<S::Intent, OperationTask<S::RunOutput, S::Failure>>,
    /// Bumped by `reset_state`; in-flight bodies from older generations
    /// must not write their results back.
    pub(crate) generation: u64,
    specification: Arc<dyn RunSpecification>,
    // Held for their cancel-on-drop behavior.
    _controller_subscriptions: Vec<Subscription>,
    _specification_subscription: Option<Subscription>,
}

pub(crate) struct StoreShared<S: OperationState> {
    path: Path,
    operation: Arc<dyn DynOperation<S>>,
    inner: ReentrantMutex<RefCell<StoreInner<S>>>,
    subscribers: Mutex<Vec<(u64, Arc<EventHandler<S>>)>>,
    next_subscriber_id: AtomicU64,
    outbox: Mutex<VecDeque<QueuedEvent<S>>>,
    draining: AtomicBool,
    /// The thread currently inside `with_exclusive_access`, with its
    /// nesting depth. Drains on that thread are deferred until the
    /// exclusive section exits, so no callback runs under the store lock.
    exclusive_owner: Mutex<Option<(std::thread::ThreadId, usize)>>,
}

/// The live, shared state machine for one operation instance.
pub struct OperationStore<S: OperationState> {
    shared: Arc<StoreShared<S>>,
}

impl<S: OperationState> Clone for OperationStore<S> {
    fn clone(&self) -> Self {
        OperationStore {
            shared: self.shared.clone(),
        }
    }
}

impl<S: OperationState> OperationStore<S> {
    /// Creates a standalone store for `operation`.
    ///
    /// Stores obtained from an [`OperationClient`](crate::OperationClient)
    /// are shared; stores created here are not registered anywhere.
    pub fn new<Op>(operation: Op, context: Context) -> Self
    where
        Op: Operation<State = S>,
    {
        Self::from_arc(Arc::new(operation), context)
    }

    pub(crate) fn from_arc<Op>(operation: Arc<Op>, mut context: Context) -> Self
    where
        Op: Operation<State = S>,
    {
        let path = operation.path();
        operation.setup(&mut context);

        let initial = Operation::initial_state(&*operation);
        let specification = context.get::<RunSpecificationsKey>().combined();
        let shared = Arc::new(StoreShared {
            path,
            operation: operation as Arc<dyn DynOperation<S>>,
            inner: ReentrantMutex::new(RefCell::new(StoreInner {
                state: initial,
                context: context.clone(),
                tasks: FxHashMap::default(),
                generation: 0,
                specification,
                _controller_subscriptions: Vec::new(),
                _specification_subscription: None,
            })),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
            outbox: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            exclusive_owner: Mutex::new(None),
        });
        let store = OperationStore { shared };
        store.install_controllers(&context);
        store.observe_specification(&context);
        store
    }

    /// The operation's path.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// A snapshot of the current state.
    pub fn current_state(&self) -> S {
        self.with_inner(|inner| inner.state.clone())
    }

    /// The derived status of the current state.
    pub fn status(&self) -> OperationStatus<S::Value, S::Failure> {
        self.with_inner(|inner| inner.state.status())
    }

    /// A snapshot of the store's context.
    pub fn context(&self) -> Context {
        self.with_inner(|inner| inner.context.clone())
    }

    /// The number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// True when the store holds no result and is not working on one.
    pub fn is_stale(&self) -> bool {
        self.with_inner(|inner| {
            inner.state.stamps().value_update_count() == 0
                && inner.state.error().is_none()
                && !inner.state.is_loading()
        })
    }

    /// Attaches a subscriber. The handler immediately receives one
    /// `state_changed` with the current state; cancelling the returned
    /// subscription detaches it. Detaching never cancels in-flight work.
    pub fn subscribe(&self, handler: EventHandler<S>) -> Subscription {
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.shared.subscribers.lock().push((id, Arc::new(handler)));

        self.with_inner(|inner| {
            self.queue(QueuedEvent {
                target: Some(id),
                event: StoreEvent::StateChanged {
                    state: inner.state.clone(),
                    context: inner.context.clone(),
                },
            });
        });
        self.maybe_run_automatically();
        self.drain();

        let weak = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.subscribers.lock().retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Runs the store's default intent, joining any in-flight run, and
    /// awaits the outcome.
    pub async fn run(
        &self,
        context: Option<Context>,
    ) -> TaskOutcome<S::RunOutput, S::Failure> {
        self.run_task(context).run_if_needed().await
    }

    /// Like [`run`](Self::run), but returns the task without awaiting it.
    pub fn run_task(&self, context: Option<Context>) -> OperationTask<S::RunOutput, S::Failure> {
        self.intent_task(S::Intent::default_intent(), context, false)
    }

    /// Records `result` directly, as if a task had returned it.
    pub fn set_result(&self, result: RunResult<S>) {
        self.with_inner(|inner| {
            let mut context = inner.context.clone();
            context.insert::<ResultUpdateReasonKey>(UpdateReason::ReturnedFinalResult);
            inner.state.update_from(&result, &context);
            self.queue_state_changed(inner);
        });
        self.drain();
    }

    /// Cancels all active tasks and resets the state to the operation's
    /// initial state. The cancellations are not reflected back into the
    /// state: the reset supersedes them.
    pub fn reset_state(&self) {
        let abandoned = self.with_inner(|inner| {
            inner.generation += 1;
            let abandoned: Vec<_> = inner.tasks.drain().map(|(_, task)| task).collect();
            inner.state = self.shared.operation.initial_state();
            self.queue_state_changed(inner);
            abandoned
        });
        for task in abandoned {
            task.cancel();
        }
        self.drain();
    }

    /// Serializes `f` against every other store access, so that several
    /// reads and writes observe and produce one consistent state. `f` may
    /// freely call back into the store.
    pub fn with_exclusive_access<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let thread = std::thread::current().id();
        let result = {
            let _guard = self.shared.inner.lock();
            {
                let mut owner = self.shared.exclusive_owner.lock();
                let depth = owner.map(|(_, depth)| depth).unwrap_or(0);
                *owner = Some((thread, depth + 1));
            }
            let result = f(self);
            {
                let mut owner = self.shared.exclusive_owner.lock();
                *owner = match *owner {
                    Some((_, depth)) if depth > 1 => Some((thread, depth - 1)),
                    _ => None,
                };
            }
            result
        };
        self.drain();
        result
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut StoreInner<S>) -> R) -> R {
        let guard = self.shared.inner.lock();
        let mut borrow = guard.borrow_mut();
        f(&mut *borrow)
    }

    pub(crate) fn from_shared(shared: Arc<StoreShared<S>>) -> Self {
        OperationStore { shared }
    }

    fn install_controllers(&self, context: &Context) {
        let controllers = context.get::<ControllersKey<S>>();
        let controls = OperationControls {
            shared: Arc::downgrade(&self.shared),
        };
        let subscriptions: Vec<Subscription> = controllers
            .iter()
            .map(|controller| controller.control(controls.clone()))
            .collect();
        if !subscriptions.is_empty() {
            self.with_inner(|inner| inner._controller_subscriptions.extend(subscriptions));
        }
    }

    fn observe_specification(&self, context: &Context) {
        let specifications = context.get::<RunSpecificationsKey>();
        if specifications.is_empty() {
            return;
        }
        let combined = specifications.combined();
        let weak = Arc::downgrade(&self.shared);
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                OperationStore::from_shared(shared).specification_changed();
            }
        });
        let subscription = combined.subscribe(context, on_change);
        self.with_inner(|inner| inner._specification_subscription = Some(subscription));
    }

    /// A run-specification change fired. Re-run if the combined
    /// specification is satisfied, joining any in-flight run.
    fn specification_changed(&self) {
        let satisfied =
            self.with_inner(|inner| inner.specification.is_satisfied(&inner.context));
        if !satisfied {
            return;
        }
        log::debug!("{:?}: specification change, scheduling re-run", self.shared.path);
        spawn_detached(self.run_task(None));
    }

    fn maybe_run_automatically(&self) {
        let task = self.with_inner(|inner| {
            if !inner.context.get::<AutomaticRunningKey>() {
                return None;
            }
            if !inner.specification.is_satisfied(&inner.context) {
                return None;
            }
            let stale = inner.state.stamps().value_update_count() == 0
                && inner.state.error().is_none()
                && !inner.tasks.values().any(|task| !task.is_finished());
            if !stale {
                return None;
            }
            Some(self.spawn_intent_locked(inner, S::Intent::default_intent(), None, false))
        });
        if let Some(task) = task {
            spawn_detached(task);
        }
    }

    pub(crate) fn intent_task(
        &self,
        intent: S::Intent,
        context: Option<Context>,
        force_fresh: bool,
    ) -> OperationTask<S::RunOutput, S::Failure> {
        let task =
            self.with_inner(|inner| self.spawn_intent_locked(inner, intent, context, force_fresh));
        self.drain();
        task
    }

    /// Creates (or joins) the task for `intent`. Must run under the inner
    /// borrow; queues a state-change event for the new active task.
    pub(crate) fn spawn_intent_locked(
        &self,
        inner: &mut StoreInner<S>,
        intent: S::Intent,
        context: Option<Context>,
        force_fresh: bool,
    ) -> OperationTask<S::RunOutput, S::Failure> {
        let context = context.unwrap_or_else(|| inner.context.clone());

        if !force_fresh && context.get::<DeduplicationKey>() {
            if let Some(existing) = inner.tasks.get(&intent) {
                if !existing.is_finished() {
                    log::debug!(
                        "{:?}: joining in-flight {:?} task {:?}",
                        self.shared.path,
                        intent,
                        existing.id()
                    );
                    return existing.clone();
                }
            }
        }

        let id = TaskId::next();
        let name: Arc<str> = format!("{} {:?}", intent.label(), self.shared.path).into();
        let mut task_context = context;
        task_context.insert::<TaskNameKey>(Some(name.clone()));

        let body = self.make_body(intent.clone(), inner.generation, id);
        let task = OperationTask::with_id(
            id,
            TaskConfiguration {
                name,
                context: task_context,
            },
            body,
        );
        inner.tasks.insert(intent.clone(), task.clone());
        inner.state.task_scheduled(&intent, task.handle());
        self.queue_state_changed(inner);
        task
    }

    fn make_body(
        &self,
        intent: S::Intent,
        generation: u64,
        task_id: TaskId,
    ) -> impl FnOnce(Context) -> BoxFuture<'static, TaskOutcome<S::RunOutput, S::Failure>> + Send + 'static
    {
        let weak = Arc::downgrade(&self.shared);
        let operation = self.shared.operation.clone();
        move |context: Context| {
            async move {
                if let Some(shared) = weak.upgrade() {
                    OperationStore::from_shared(shared).intent_began(&context);
                }

                let outcome =
                    run_with_retries(operation, weak.clone(), intent.clone(), context.clone())
                        .await;

                if let Some(shared) = weak.upgrade() {
                    OperationStore::from_shared(shared).intent_settled(
                        &intent,
                        task_id,
                        generation,
                        &context,
                        &outcome,
                    );
                }
                outcome
            }
            .boxed()
        }
    }

    fn intent_began(&self, context: &Context) {
        self.with_inner(|inner| {
            self.queue(QueuedEvent {
                target: None,
                event: StoreEvent::FetchingStarted {
                    context: context.clone(),
                },
            });
            self.queue_state_changed(inner);
        });
        self.drain();
    }

    fn intent_settled(
        &self,
        intent: &S::Intent,
        task_id: TaskId,
        generation: u64,
        context: &Context,
        outcome: &TaskOutcome<S::RunOutput, S::Failure>,
    ) {
        let mut update_context = context.clone();
        update_context.insert::<ResultUpdateReasonKey>(UpdateReason::ReturnedFinalResult);

        let alert = self.with_inner(|inner| {
            if inner.generation != generation {
                // A reset superseded this run; drop the result on the floor.
                return None;
            }
            if let Some(current) = inner.tasks.get(intent) {
                if current.id() == task_id {
                    inner.tasks.remove(intent);
                }
            }
            inner.state.task_settled(intent, task_id);

            let result: Option<RunResult<S>> = match outcome {
                Ok(value) => Some(Ok(value.clone())),
                Err(TaskError::Failure(error)) => Some(Err(error.clone())),
                Err(TaskError::Cancelled) => None,
            };
            if let Some(result) = &result {
                inner.state.update_from(result, &update_context);
            }

            self.queue_state_changed(inner);
            if let Some(result) = result {
                let alert = terminal_alert::<S>(&update_context, &result);
                self.queue(QueuedEvent {
                    target: None,
                    event: StoreEvent::ResultReceived {
                        result,
                        context: update_context.clone(),
                    },
                });
                self.queue(QueuedEvent {
                    target: None,
                    event: StoreEvent::FetchingEnded {
                        context: update_context.clone(),
                    },
                });
                alert
            } else {
                self.queue(QueuedEvent {
                    target: None,
                    event: StoreEvent::FetchingEnded {
                        context: update_context.clone(),
                    },
                });
                None
            }
        });

        if let Some(message) = alert {
            if let Some(sink) = update_context.get::<AlertSinkKey>() {
                sink.post(message);
            }
        }
        self.drain();
    }

    pub(crate) fn apply_yield(&self, result: RunResult<S>, context: &Context) {
        let mut yield_context = context.clone();
        yield_context.insert::<ResultUpdateReasonKey>(UpdateReason::YieldedResult);
        self.with_inner(|inner| {
            inner.state.update_from(&result, &yield_context);
            self.queue_state_changed(inner);
            self.queue(QueuedEvent {
                target: None,
                event: StoreEvent::ResultReceived {
                    result,
                    context: yield_context.clone(),
                },
            });
        });
        self.drain();
    }

    pub(crate) fn emit_operation_event(&self, event: S::Event, context: &Context) {
        self.queue(QueuedEvent {
            target: None,
            event: StoreEvent::Operation {
                event,
                context: context.clone(),
            },
        });
        self.drain();
    }

    pub(crate) fn queue_state_changed(&self, inner: &StoreInner<S>) {
        self.queue(QueuedEvent {
            target: None,
            event: StoreEvent::StateChanged {
                state: inner.state.clone(),
                context: inner.context.clone(),
            },
        });
    }

    fn queue(&self, event: QueuedEvent<S>) {
        self.shared.outbox.lock().push_back(event);
    }

    /// Delivers queued events. Only one thread drains at a time, which
    /// preserves per-subscriber ordering; no lock is held across the
    /// subscriber callbacks.
    pub(crate) fn drain(&self) {
        // Inside an exclusive section, events wait for the section's exit.
        if let Some((owner, _)) = *self.shared.exclusive_owner.lock() {
            if owner == std::thread::current().id() {
                return;
            }
        }
        loop {
            if self
                .shared
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            loop {
                let queued = match self.shared.outbox.lock().pop_front() {
                    Some(queued) => queued,
                    None => break,
                };
                let subscribers: Vec<(u64, Arc<EventHandler<S>>)> =
                    self.shared.subscribers.lock().clone();
                for (id, handler) in subscribers {
                    if queued.target.map_or(true, |target| target == id) {
                        handler.dispatch(&queued.event);
                    }
                }
            }
            self.shared.draining.store(false, Ordering::SeqCst);
            if self.shared.outbox.lock().is_empty() {
                return;
            }
            // Events raced in while the flag was being released; loop to
            // claim the drain again.
        }
    }
}

impl<S: OperationState> fmt::Debug for OperationStore<S> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("OperationStore")
            .field("path", &self.shared.path)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn terminal_alert<S: OperationState>(
    context: &Context,
    result: &RunResult<S>,
) -> Option<AlertMessage> {
    let configuration = context.get::<AlertsKey>();
    match result {
        Ok(_) => configuration.success,
        Err(_) => configuration.failure,
    }
}

/// Runs the operation body with the retry loop of the store: before each
/// attempt the delayer sleeps the backoff for that attempt index (zero for
/// attempt 0), and failures are retried while the retry policy accepts
/// them and attempts remain. Yields do not consume retries.
async fn run_with_retries<S: OperationState>(
    operation: Arc<dyn DynOperation<S>>,
    store: Weak<StoreShared<S>>,
    intent: S::Intent,
    context: Context,
) -> TaskOutcome<S::RunOutput, S::Failure> {
    let max_retries = context.get::<MaxRetriesKey>();
    let backoff = context.get::<BackoffKey>();
    let delayer = context.get::<DelayerKey>();
    let predicate = context.get::<RetryPredicateKey<S::Failure>>();

    let mut attempt = 0_usize;
    loop {
        let mut attempt_context = context.clone();
        attempt_context.insert::<RetryIndexKey>(Some(attempt));

        delayer.delay(backoff.delay(attempt)).await;

        let continuation = OperationContinuation {
            shared: store.clone(),
            context: attempt_context.clone(),
        };
        match operation.clone().run(attempt_context, continuation).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt + 1 <= max_retries && predicate.should_retry(&error) {
                    log::debug!(
                        "{:?} attempt {} failed, retrying",
                        intent,
                        attempt
                    );
                    attempt += 1;
                    continue;
                }
                return Err(TaskError::Failure(error));
            }
        }
    }
}

fn spawn_detached<V, E>(task: OperationTask<V, E>)
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = task.run_if_needed().await;
            });
        }
        Err(_) => log::debug!(
            "no async runtime available; task {:?} stays scheduled until awaited",
            task.name()
        ),
    }
}

/// Streams interim results and variant-specific events from a running
/// operation body back into its store.
pub struct OperationContinuation<S: OperationState> {
    shared: Weak<StoreShared<S>>,
    context: Context,
}

impl<S: OperationState> Clone for OperationContinuation<S> {
    fn clone(&self) -> Self {
        OperationContinuation {
            shared: self.shared.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S: OperationState> OperationContinuation<S> {
    /// A continuation not attached to any store; yields and events are
    /// dropped. Useful for exercising operation bodies directly in tests.
    pub fn detached(context: Context) -> Self {
        OperationContinuation {
            shared: Weak::new(),
            context,
        }
    }

    /// Streams an interim value. The state is updated with the
    /// yielded-result reason: subscribers see `state_changed` and
    /// `result_received`, but the run is not terminated and no retry is
    /// consumed.
    pub fn yield_value(&self, output: S::RunOutput) {
        self.yield_result(Ok(output));
    }

    /// Streams an interim error.
    pub fn yield_error(&self, error: S::Failure) {
        self.yield_result(Err(error));
    }

    /// Streams an interim result.
    pub fn yield_result(&self, result: RunResult<S>) {
        if let Some(shared) = self.shared.upgrade() {
            OperationStore::from_shared(shared).apply_yield(result, &self.context);
        }
    }

    /// A snapshot of the store's current state, if the store is alive.
    pub fn state(&self) -> Option<S> {
        self.shared
            .upgrade()
            .map(|shared| OperationStore::from_shared(shared).current_state())
    }

    /// The context of the current attempt.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Emits a variant-specific event to subscribers.
    pub fn emit(&self, event: S::Event) {
        if let Some(shared) = self.shared.upgrade() {
            OperationStore::from_shared(shared).emit_operation_event(event, &self.context);
        }
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&OperationStore<S>) -> R) -> Option<R> {
        self.shared
            .upgrade()
            .map(|shared| f(&OperationStore::from_shared(shared)))
    }
}

/// The interface a store hands to its controllers.
pub struct OperationControls<S: OperationState> {
    shared: Weak<StoreShared<S>>,
}

impl<S: OperationState> Clone for OperationControls<S> {
    fn clone(&self) -> Self {
        OperationControls {
            shared: self.shared.clone(),
        }
    }
}

impl<S: OperationState> OperationControls<S> {
    /// Injects a value, recorded with the yielded-result reason.
    pub fn yield_value(&self, output: S::RunOutput) {
        self.yield_result(Ok(output));
    }

    /// Injects an error, recorded with the yielded-result reason.
    pub fn yield_error(&self, error: S::Failure) {
        self.yield_result(Err(error));
    }

    /// Injects a result, recorded with the yielded-result reason.
    pub fn yield_result(&self, result: RunResult<S>) {
        if let Some(shared) = self.shared.upgrade() {
            let store = OperationStore::from_shared(shared);
            let context = store.context();
            store.apply_yield(result, &context);
        }
    }

    /// Schedules a fresh run of the store's default intent without
    /// running it, joining any in-flight run. `None` when the store has
    /// been dropped.
    pub fn yield_rerun_task(&self) -> Option<OperationTask<S::RunOutput, S::Failure>> {
        self.shared
            .upgrade()
            .map(|shared| OperationStore::from_shared(shared).run_task(None))
    }

    /// Schedules a run that bypasses deduplication, so it re-executes even
    /// while another run is in flight. `None` when the store has been
    /// dropped.
    pub fn yield_refetch_task(&self) -> Option<OperationTask<S::RunOutput, S::Failure>> {
        self.shared.upgrade().map(|shared| {
            OperationStore::from_shared(shared).intent_task(
                S::Intent::default_intent(),
                None,
                true,
            )
        })
    }

    /// A snapshot of the store's current state, if the store is alive.
    pub fn state(&self) -> Option<S> {
        self.shared
            .upgrade()
            .map(|shared| OperationStore::from_shared(shared).current_state())
    }

    /// The number of attached subscribers, if the store is alive.
    pub fn subscriber_count(&self) -> Option<usize> {
        self.shared
            .upgrade()
            .map(|shared| OperationStore::from_shared(shared).subscriber_count())
    }
}
