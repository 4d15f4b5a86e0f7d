//! The modifier pipeline.
//!
//! Operations compose: `op.retry(3).deduplicated().backoff(...)` wraps the
//! operation in decorators that preserve its state type. Most modifiers
//! are pure context writes layered in [`Operation::setup`] (the store
//! reads the effective values at run time); a few wrap the run itself.
//! Later modifiers win over earlier ones, and every modifier wins over
//! the client's per-kind defaults.

use crate::backoff::{Backoff, BackoffKey, MaxRetriesKey};
use crate::context::{Context, ContextKey};
use crate::path::Path;
use crate::run_spec::{
    always, NotificationSpecification, RunSpecification, RunSpecificationsKey,
    APPLICATION_ACTIVE_LABEL, NETWORK_CONNECTED_LABEL,
};
use crate::run_spec::AutomaticRunningKey;
use crate::sources::{AlertMessage, EvictableMemoryPressureKey, MemoryPressureSet};
use crate::state::{OperationState, SingleState};
use crate::store::{
    AlertConfiguration, AlertsKey, ControllersKey, DeduplicationKey, Operation,
    OperationContinuation, OperationController, RunResult,
};
use crate::time::{ClockKey, DelayerKey};
use crate::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A decorator over an operation. Every hook defaults to delegating to the
/// wrapped operation.
pub trait OperationModifier<Op: Operation>: Send + Sync + 'static {
    /// Layers context adjustments over the wrapped operation's.
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
    }

    /// Overrides the initial (and reset) state.
    fn initial_state(&self, operation: &Op) -> Op::State {
        operation.initial_state()
    }

    /// Wraps one run attempt.
    fn run(
        &self,
        operation: Arc<Op>,
        context: Context,
        continuation: OperationContinuation<Op::State>,
    ) -> BoxFuture<'static, RunResult<Op::State>> {
        operation.run(context, continuation)
    }
}

/// An operation wrapped by a modifier. Created by the
/// [`OperationExt`] builder methods.
pub struct Modified<Op, M> {
    operation: Arc<Op>,
    modifier: M,
}

impl<Op, M> Modified<Op, M> {
    /// Wraps `operation` with `modifier`.
    pub fn new(operation: Op, modifier: M) -> Self {
        Modified {
            operation: Arc::new(operation),
            modifier,
        }
    }
}

impl<Op, M> Operation for Modified<Op, M>
where
    Op: Operation,
    M: OperationModifier<Op>,
{
    type State = Op::State;

    fn path(&self) -> Path {
        self.operation.path()
    }

    fn initial_state(&self) -> Op::State {
        self.modifier.initial_state(&self.operation)
    }

    fn setup(&self, context: &mut Context) {
        self.modifier.setup(&self.operation, context);
    }

    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Self::State>,
    ) -> BoxFuture<'static, RunResult<Self::State>> {
        self.modifier
            .run(self.operation.clone(), context, continuation)
    }
}

/// Writes the retry limit; together with the backoff it drives the store's
/// retry loop.
pub struct RetryLimit(usize);

impl<Op: Operation> OperationModifier<Op> for RetryLimit {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.insert::<MaxRetriesKey>(self.0);
    }
}

/// Writes the backoff function.
pub struct WithBackoff(Backoff);

impl<Op: Operation> OperationModifier<Op> for WithBackoff {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.insert::<BackoffKey>(self.0.clone());
    }
}

/// Ensures at most one in-flight task per intent.
pub struct Deduplicated;

impl<Op: Operation> OperationModifier<Op> for Deduplicated {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.insert::<DeduplicationKey>(true);
    }
}

/// Enables automatic running gated on a specification.
pub struct EnableAutomaticRunning(Arc<dyn RunSpecification>);

impl<Op: Operation> OperationModifier<Op> for EnableAutomaticRunning {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        let specification = self.0.clone();
        context.update::<RunSpecificationsKey>(|specs| specs.push(specification));
        context.insert::<AutomaticRunningKey>(true);
    }
}

/// Subscribes to a specification; a change while it is satisfied schedules
/// a re-run that joins any in-flight run.
pub struct RerunOnChange(Arc<dyn RunSpecification>);

impl<Op: Operation> OperationModifier<Op> for RerunOnChange {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        let specification = self.0.clone();
        context.update::<RunSpecificationsKey>(|specs| specs.push(specification));
    }
}

/// Makes the effective specification `always(false)`: the store never runs
/// on its own.
pub struct DisableAutomaticRunning;

impl<Op: Operation> OperationModifier<Op> for DisableAutomaticRunning {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.update::<RunSpecificationsKey>(|specs| specs.replace(vec![always(false)]));
        context.insert::<AutomaticRunningKey>(false);
    }
}

/// Seeds the initial (and reset) state with a value, so `current_value`
/// is never absent. Single-value operations only.
pub struct DefaultValue<V>(V);

impl<Op, V, E> OperationModifier<Op> for DefaultValue<V>
where
    Op: Operation<State = SingleState<V, E>>,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn initial_state(&self, _operation: &Op) -> SingleState<V, E> {
        SingleState::with_initial_value(self.0.clone())
    }
}

/// Writes the set of memory-pressure levels under which the store may be
/// evicted.
pub struct EvictWhen(MemoryPressureSet);

impl<Op: Operation> OperationModifier<Op> for EvictWhen {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.insert::<EvictableMemoryPressureKey>(self.0);
    }
}

/// Removes the built-in connectivity specification.
pub struct CompletelyOffline;

impl<Op: Operation> OperationModifier<Op> for CompletelyOffline {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context
            .update::<RunSpecificationsKey>(|specs| specs.remove_label(NETWORK_CONNECTED_LABEL));
    }
}

/// Removes the built-in application-active specification.
pub struct DisableApplicationActiveRerunning;

impl<Op: Operation> OperationModifier<Op> for DisableApplicationActiveRerunning {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context
            .update::<RunSpecificationsKey>(|specs| specs.remove_label(APPLICATION_ACTIVE_LABEL));
    }
}

/// Installs a controller on the store.
pub struct ControlledBy<S: OperationState>(Arc<dyn OperationController<S>>);

impl<Op> OperationModifier<Op> for ControlledBy<Op::State>
where
    Op: Operation,
{
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        let controller = self.0.clone();
        context.update::<ControllersKey<Op::State>>(|controllers| controllers.push(controller));
    }
}

/// Configures the alert messages posted on terminal results.
pub struct Alerts(AlertConfiguration);

impl<Op: Operation> OperationModifier<Op> for Alerts {
    fn setup(&self, operation: &Op, context: &mut Context) {
        operation.setup(context);
        context.insert::<AlertsKey>(self.0.clone());
    }
}

/// Context key marking a preview (development) environment; the
/// preview-delay modifier only sleeps when this is set.
pub struct PreviewKey;

impl ContextKey for PreviewKey {
    type Value = bool;

    fn default_value() -> bool {
        false
    }

    fn name() -> &'static str {
        "Preview"
    }
}

/// In preview contexts, sleeps a fixed or random duration before every
/// attempt, making loading states visible during development.
pub struct PreviewDelay {
    duration: Option<Duration>,
    rng: Mutex<oorandom::Rand64>,
}

impl<Op: Operation> OperationModifier<Op> for PreviewDelay {
    fn run(
        &self,
        operation: Arc<Op>,
        context: Context,
        continuation: OperationContinuation<Op::State>,
    ) -> BoxFuture<'static, RunResult<Op::State>> {
        if !context.get::<PreviewKey>() {
            return operation.run(context, continuation);
        }
        let duration = self.duration.unwrap_or_else(|| {
            Duration::from_millis(self.rng.lock().rand_range(100..2_000))
        });
        let delayer = context.get::<DelayerKey>();
        async move {
            delayer.delay(duration).await;
            operation.run(context, continuation).await
        }
        .boxed()
    }
}

/// Logs how long each attempt took, through the context's clock.
pub struct LogDuration;

impl<Op: Operation> OperationModifier<Op> for LogDuration {
    fn run(
        &self,
        operation: Arc<Op>,
        context: Context,
        continuation: OperationContinuation<Op::State>,
    ) -> BoxFuture<'static, RunResult<Op::State>> {
        let clock = context.get::<ClockKey>();
        let name = context.get::<crate::task::TaskNameKey>();
        async move {
            let started = clock.now();
            let result = operation.run(context, continuation).await;
            log::info!(
                "{} took {:?}",
                name.as_deref().unwrap_or("operation"),
                clock.now().duration_since(started)
            );
            result
        }
        .boxed()
    }
}

/// Builder-style construction of the modifier pipeline, available on every
/// operation.
pub trait OperationExt: Operation + Sized {
    /// Allows up to `limit` retries after the first failed attempt.
    fn retry(self, limit: usize) -> Modified<Self, RetryLimit> {
        Modified::new(self, RetryLimit(limit))
    }

    /// Sets the backoff function driving retry delays.
    fn backoff(self, backoff: Backoff) -> Modified<Self, WithBackoff> {
        Modified::new(self, WithBackoff(backoff))
    }

    /// Shares one in-flight task per intent among concurrent callers.
    fn deduplicated(self) -> Modified<Self, Deduplicated> {
        Modified::new(self, Deduplicated)
    }

    /// Runs automatically on subscriber attach, but only while `only_when`
    /// (combined with the other installed specifications) is satisfied.
    fn enable_automatic_running(
        self,
        only_when: Arc<dyn RunSpecification>,
    ) -> Modified<Self, EnableAutomaticRunning> {
        Modified::new(self, EnableAutomaticRunning(only_when))
    }

    /// Schedules a re-run whenever `specification` signals a change while
    /// satisfied.
    fn rerun_on_change(
        self,
        specification: Arc<dyn RunSpecification>,
    ) -> Modified<Self, RerunOnChange> {
        Modified::new(self, RerunOnChange(specification))
    }

    /// Never runs automatically.
    fn disable_automatic_running(self) -> Modified<Self, DisableAutomaticRunning> {
        Modified::new(self, DisableAutomaticRunning)
    }

    /// Seeds the state so `current_value` is always present.
    fn default_value<V, E>(self, value: V) -> Modified<Self, DefaultValue<V>>
    where
        Self: Operation<State = SingleState<V, E>>,
        V: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        Modified::new(self, DefaultValue(value))
    }

    /// Controls which memory-pressure levels evict this store.
    fn evict_when(self, levels: MemoryPressureSet) -> Modified<Self, EvictWhen> {
        Modified::new(self, EvictWhen(levels))
    }

    /// Removes the built-in connectivity gate.
    fn completely_offline(self) -> Modified<Self, CompletelyOffline> {
        Modified::new(self, CompletelyOffline)
    }

    /// Removes the built-in application-active re-run trigger.
    fn disable_application_active_rerunning(
        self,
    ) -> Modified<Self, DisableApplicationActiveRerunning> {
        Modified::new(self, DisableApplicationActiveRerunning)
    }

    /// Installs `controller` on the store.
    fn controlled_by(
        self,
        controller: Arc<dyn OperationController<Self::State>>,
    ) -> Modified<Self, ControlledBy<Self::State>> {
        Modified::new(self, ControlledBy(controller))
    }

    /// Posts `success`/`failure` alerts on terminal results. Cancellation
    /// posts nothing.
    fn alerts(
        self,
        success: Option<AlertMessage>,
        failure: Option<AlertMessage>,
    ) -> Modified<Self, Alerts> {
        Modified::new(self, Alerts(AlertConfiguration { success, failure }))
    }

    /// Re-runs whenever `notification` is posted on the context's
    /// notification source.
    fn refetch_on(self, notification: &str) -> Modified<Self, RerunOnChange> {
        Modified::new(
            self,
            RerunOnChange(Arc::new(NotificationSpecification::new(notification))),
        )
    }

    /// Sleeps before running in preview contexts; random within 0.1–2 s
    /// when `duration` is `None`.
    fn preview_delay(self, duration: Option<Duration>) -> Modified<Self, PreviewDelay> {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        Modified::new(
            self,
            PreviewDelay {
                duration,
                rng: Mutex::new(oorandom::Rand64::new(seed)),
            },
        )
    }

    /// Logs each attempt's duration.
    fn log_duration(self) -> Modified<Self, LogDuration> {
        Modified::new(self, LogDuration)
    }
}

impl<Op: Operation> OperationExt for Op {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_spec::NetworkConnectedSpecification;
    use crate::{path, FetchOperation, Single};
    use futures_util::FutureExt;

    struct Answer;

    impl FetchOperation for Answer {
        type Value = u32;
        type Failure = String;

        fn path(&self) -> Path {
            path!["answer"]
        }

        fn fetch(
            self: Arc<Self>,
            _context: Context,
            _continuation: OperationContinuation<SingleState<u32, String>>,
        ) -> BoxFuture<'static, Result<u32, String>> {
            async { Ok(42) }.boxed()
        }
    }

    fn prepared_context<Op: Operation>(operation: &Op) -> Context {
        let mut context = Context::new();
        operation.setup(&mut context);
        context
    }

    #[test]
    fn context_writing_modifiers_layer_over_the_operation() {
        let operation = Single::new(Answer)
            .retry(5)
            .backoff(Backoff::linear(Duration::from_millis(2)))
            .deduplicated()
            .evict_when(MemoryPressureSet::critical_only());

        let context = prepared_context(&operation);
        assert_eq!(context.get::<MaxRetriesKey>(), 5);
        assert_eq!(context.get::<BackoffKey>().label(), "linear");
        assert!(context.get::<DeduplicationKey>());
        assert_eq!(
            context.get::<EvictableMemoryPressureKey>(),
            MemoryPressureSet::critical_only()
        );
    }

    #[test]
    fn later_modifiers_win() {
        let operation = Single::new(Answer).retry(2).retry(7);
        assert_eq!(prepared_context(&operation).get::<MaxRetriesKey>(), 7);
    }

    #[test]
    fn automatic_running_modifiers_adjust_the_specifications() {
        let operation = Single::new(Answer)
            .enable_automatic_running(Arc::new(NetworkConnectedSpecification));
        let context = prepared_context(&operation);
        assert!(context.get::<AutomaticRunningKey>());
        assert_eq!(
            format!("{:?}", context.get::<RunSpecificationsKey>()),
            "[\"network-connected\"]"
        );

        let offline = Single::new(Answer)
            .enable_automatic_running(Arc::new(NetworkConnectedSpecification))
            .completely_offline();
        let context = prepared_context(&offline);
        assert_eq!(format!("{:?}", context.get::<RunSpecificationsKey>()), "[]");

        let disabled = Single::new(Answer).disable_automatic_running();
        let context = prepared_context(&disabled);
        assert!(!context.get::<AutomaticRunningKey>());
        assert_eq!(
            format!("{:?}", context.get::<RunSpecificationsKey>()),
            "[\"always\"]"
        );
    }

    #[test]
    fn default_value_seeds_the_initial_state() {
        let operation = Single::new(Answer).default_value(7_u32);
        let state = operation.initial_state();
        assert_eq!(state.value(), Some(&7));
        assert_eq!(state.stamps().value_update_count(), 0);
    }

    #[test]
    fn alerts_modifier_writes_the_configuration() {
        let operation = Single::new(Answer).alerts(
            Some(AlertMessage::new("saved")),
            Some(AlertMessage::new("failed")),
        );
        let context = prepared_context(&operation);
        let configuration = context.get::<AlertsKey>();
        assert_eq!(configuration.success, Some(AlertMessage::new("saved")));
        assert_eq!(configuration.failure, Some(AlertMessage::new("failed")));
    }
}
