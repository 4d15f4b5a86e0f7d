//! Operation state: the data a store owns on behalf of its subscribers.
//!
//! There are three state variants — single-value ([`SingleState`]),
//! paginated ([`PaginatedState`](crate::paginated::PaginatedState)) and
//! mutation ([`MutationState`](crate::mutation::MutationState)) — sharing
//! the [`OperationState`] capability. `update_from` is the authoritative
//! transition function: it is the only legal way to advance the update
//! counters and timestamps.

use crate::context::{Context, ContextKey};
use crate::task::{TaskHandle, TaskId};
use crate::time::ClockKey;
use std::fmt;
use std::hash::Hash;
use std::time::Instant;

/// The kind of operation a state variant belongs to; used by store
/// creators to pick per-kind defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// One value per run.
    Single,
    /// An ordered collection of pages.
    Paginated,
    /// A side effect with arguments and history.
    Mutation,
}

/// Why a result is being recorded into state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateReason {
    /// The task body returned; this is the operation's final outcome.
    ReturnedFinalResult,
    /// The task body streamed an interim value through its continuation.
    YieldedResult,
}

/// Context key carrying the [`UpdateReason`] during `update_from`.
pub struct ResultUpdateReasonKey;

impl ContextKey for ResultUpdateReasonKey {
    type Value = UpdateReason;

    fn default_value() -> UpdateReason {
        UpdateReason::ReturnedFinalResult
    }

    fn name() -> &'static str {
        "ResultUpdateReason"
    }
}

/// The externally observable phase of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus<V, E> {
    /// Never ran and holds no result.
    Idle,
    /// At least one active task has started.
    Loading,
    /// The last recorded result was a success.
    Success(V),
    /// The last recorded result was a failure.
    Failure(E),
}

impl<V, E> OperationStatus<V, E> {
    /// True for [`OperationStatus::Loading`].
    pub fn is_loading(&self) -> bool {
        matches!(self, OperationStatus::Loading)
    }

    /// True for [`OperationStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success(_))
    }

    /// True for [`OperationStatus::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self, OperationStatus::Failure(_))
    }
}

/// Update counters and timestamps shared by every state variant.
///
/// Timestamps are monotonically non-decreasing under the store's clock.
#[derive(Clone, Debug, Default)]
pub struct UpdateStamps {
    value_update_count: u64,
    value_last_updated_at: Option<Instant>,
    error_update_count: u64,
    error_last_updated_at: Option<Instant>,
}

impl UpdateStamps {
    /// How many times a value has been recorded.
    pub fn value_update_count(&self) -> u64 {
        self.value_update_count
    }

    /// When a value was last recorded.
    pub fn value_last_updated_at(&self) -> Option<Instant> {
        self.value_last_updated_at
    }

    /// How many times an error has been recorded.
    pub fn error_update_count(&self) -> u64 {
        self.error_update_count
    }

    /// When an error was last recorded.
    pub fn error_last_updated_at(&self) -> Option<Instant> {
        self.error_last_updated_at
    }

    pub(crate) fn record_value(&mut self, now: Instant) {
        self.value_update_count += 1;
        self.value_last_updated_at = Some(match self.value_last_updated_at {
            Some(previous) => previous.max(now),
            None => now,
        });
    }

    pub(crate) fn record_error(&mut self, now: Instant) {
        self.error_update_count += 1;
        self.error_last_updated_at = Some(match self.error_last_updated_at {
            Some(previous) => previous.max(now),
            None => now,
        });
    }
}

/// A named mode of executing a store's operation. Deduplication is per
/// intent: at most one task is in flight for each distinct intent value.
pub trait OperationIntent:
    Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static
{
    /// The intent used by the store's plain `run`/`run_task` entry points.
    fn default_intent() -> Self;

    /// A short label used in task names.
    fn label(&self) -> &'static str;
}

/// The capability common to the three state variants.
pub trait OperationState: Clone + Send + Sync + 'static {
    /// The state's value (a plain value, the page collection, or the last
    /// mutation output).
    type Value: Clone + Send + Sync + 'static;
    /// What one executed intent produces.
    type RunOutput: Clone + Send + Sync + 'static;
    /// The operation's failure type.
    type Failure: Clone + Send + Sync + 'static;
    /// The state's intent space.
    type Intent: OperationIntent;
    /// Variant-specific subscriber event payload.
    type Event: Clone + Send + Sync + 'static;

    /// Which kind of operation this state belongs to.
    const KIND: OperationKind;

    /// The current value, if one has ever been recorded (or seeded).
    fn current_value(&self) -> Option<&Self::Value>;

    /// The most recently recorded error, cleared by a final success.
    fn error(&self) -> Option<&Self::Failure>;

    /// The update counters and timestamps.
    fn stamps(&self) -> &UpdateStamps;

    /// Records a result. The context supplies the clock, the
    /// [`UpdateReason`] and any variant-specific bookkeeping keys.
    fn update_from(&mut self, result: &Result<Self::RunOutput, Self::Failure>, context: &Context);

    /// Registers an active task under `intent`.
    fn task_scheduled(&mut self, intent: &Self::Intent, task: TaskHandle);

    /// Removes a settled task from `intent`'s active list.
    fn task_settled(&mut self, intent: &Self::Intent, task: TaskId);

    /// Every active task, ordered by scheduling.
    fn active_tasks(&self) -> Vec<TaskHandle>;

    /// True while at least one active task has started and not finished.
    fn is_loading(&self) -> bool {
        self.active_tasks()
            .iter()
            .any(|task| task.has_started() && !task.is_finished())
    }

    /// The derived status: loading wins over recorded results.
    fn status(&self) -> OperationStatus<Self::Value, Self::Failure> {
        if self.is_loading() {
            return OperationStatus::Loading;
        }
        if let Some(error) = self.error() {
            return OperationStatus::Failure(error.clone());
        }
        match self.current_value() {
            Some(value) if self.stamps().value_update_count() > 0 => {
                OperationStatus::Success(value.clone())
            }
            _ => OperationStatus::Idle,
        }
    }
}

/// The intent space of single-value operations: there is only one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SingleIntent;

impl OperationIntent for SingleIntent {
    fn default_intent() -> Self {
        SingleIntent
    }

    fn label(&self) -> &'static str {
        "fetch"
    }
}

/// Single-value operations have no variant-specific events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoEvent {}

/// State of a single-value operation.
#[derive(Clone)]
pub struct SingleState<V, E> {
    value: Option<V>,
    error: Option<E>,
    stamps: UpdateStamps,
    active: Vec<TaskHandle>,
}

impl<V, E> SingleState<V, E> {
    /// An idle state with no value.
    pub fn new() -> Self {
        SingleState {
            value: None,
            error: None,
            stamps: UpdateStamps::default(),
            active: Vec::new(),
        }
    }

    /// An idle state seeded with `value`; used by the default-value
    /// modifier so `current_value` is never absent.
    pub fn with_initial_value(value: V) -> Self {
        SingleState {
            value: Some(value),
            ..SingleState::new()
        }
    }

    /// The current value.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }
}

impl<V, E> Default for SingleState<V, E> {
    fn default() -> Self {
        SingleState::new()
    }
}

impl<V, E> OperationState for SingleState<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Value = V;
    type RunOutput = V;
    type Failure = E;
    type Intent = SingleIntent;
    type Event = NoEvent;

    const KIND: OperationKind = OperationKind::Single;

    fn current_value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    fn stamps(&self) -> &UpdateStamps {
        &self.stamps
    }

    fn update_from(&mut self, result: &Result<V, E>, context: &Context) {
        let now = context.get::<ClockKey>().now();
        match result {
            Ok(value) => {
                self.value = Some(value.clone());
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

    fn task_scheduled(&mut self, _intent: &SingleIntent, task: TaskHandle) {
        self.active.push(task);
    }

    fn task_settled(&mut self, _intent: &SingleIntent, task: TaskId) {
        self.active.retain(|active| active.id() != task);
    }

    fn active_tasks(&self) -> Vec<TaskHandle> {
        self.active.clone()
    }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for SingleState<V, E> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SingleState")
            .field("value", &self.value)
            .field("error", &self.error)
            .field("stamps", &self.stamps)
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::task::{OperationTask, TaskConfiguration};
    use futures_util::FutureExt;

    type State = SingleState<u32, String>;

    #[test]
    fn fresh_state_is_idle() {
        let state = State::new();
        assert_eq!(state.status(), OperationStatus::Idle);
        assert_eq!(state.stamps().value_update_count(), 0);
        assert!(state.current_value().is_none());
    }

    #[test]
    fn seeded_state_is_idle_but_has_a_value() {
        let state = State::with_initial_value(9);
        assert_eq!(state.current_value(), Some(&9));
        assert_eq!(state.status(), OperationStatus::Idle);
    }

    #[test]
    fn final_success_clears_the_error() {
        let context = Context::new();
        let mut state = State::new();

        state.update_from(&Err("bad".to_owned()), &context);
        assert_eq!(state.status(), OperationStatus::Failure("bad".to_owned()));
        assert_eq!(state.stamps().error_update_count(), 1);

        state.update_from(&Ok(4), &context);
        assert_eq!(state.status(), OperationStatus::Success(4));
        assert!(state.error().is_none());
        assert_eq!(state.stamps().value_update_count(), 1);
        assert!(state.stamps().value_last_updated_at().is_some());
    }

    #[test]
    fn yielded_success_keeps_the_error() {
        let mut context = Context::new();
        let mut state = State::new();
        state.update_from(&Err("bad".to_owned()), &context);

        context.insert::<ResultUpdateReasonKey>(UpdateReason::YieldedResult);
        state.update_from(&Ok(4), &context);
        assert_eq!(state.current_value(), Some(&4));
        assert!(state.error().is_some());
    }

    #[tokio::test]
    async fn loading_requires_a_started_task() {
        let mut state = State::new();
        let task = OperationTask::<u32, String>::new(
            TaskConfiguration {
                name: "probe".into(),
                context: Context::new(),
            },
            |_context| async { Ok(1) }.boxed(),
        );

        state.task_scheduled(&SingleIntent, task.handle());
        // Scheduled but never started: not loading.
        assert!(!state.is_loading());
        assert_eq!(state.status(), OperationStatus::Idle);

        let _ = task.run_if_needed().await;
        state.task_settled(&SingleIntent, task.id());
        assert!(!state.is_loading());
        assert!(state.active_tasks().is_empty());
    }
}
