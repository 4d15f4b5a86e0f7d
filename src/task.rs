//! One-shot asynchronous units of work.
//!
//! An [`OperationTask`] owns a body that runs at most once, no matter how
//! many callers await it: the first `run_if_needed` hosts the body on the
//! runtime, later callers register a waiter and observe the same outcome.
//! Tasks may declare scheduling dependencies on other tasks, which are
//! awaited (best-effort) before the body runs.

use crate::context::{Context, ContextKey};
use crate::sources::{Diagnostic, DiagnosticReporterKey};
use crate::BoxFuture;
use crossbeam_utils::atomic::AtomicCell;
use futures_channel::oneshot;
use futures_util::FutureExt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The failure channel of a task: either the body's own error, or
/// cooperative cancellation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// The task was cancelled before or while running.
    #[error("the task was cancelled")]
    Cancelled,
    /// The operation body returned an error.
    #[error("the operation failed")]
    Failure(E),
}

impl<E> TaskError<E> {
    /// True for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// Extracts the operation failure, if any.
    pub fn failure(self) -> Option<E> {
        match self {
            TaskError::Cancelled => None,
            TaskError::Failure(error) => Some(error),
        }
    }
}

/// What a task resolves with.
pub type TaskOutcome<V, E> = Result<V, TaskError<E>>;

/// A process-local task identifier; allocation order is monotonic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl TaskId {
    pub(crate) fn next() -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Context key carrying the human-readable name of the currently running
/// task, when there is one.
pub struct TaskNameKey;

impl ContextKey for TaskNameKey {
    type Value = Option<Arc<str>>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "TaskName"
    }
}

/// A task's immutable configuration: its name and the context snapshot its
/// body will observe.
#[derive(Clone, Debug)]
pub struct TaskConfiguration {
    /// Human-readable task name, used in diagnostics.
    pub name: Arc<str>,
    /// The context the body runs with.
    pub context: Context,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TaskPhase {
    Pending,
    Running,
    Finished,
}

type TaskBody<V, E> = Box<dyn FnOnce(Context) -> BoxFuture<'static, TaskOutcome<V, E>> + Send>;

enum TaskLifecycle<V, E> {
    Pending {
        body: TaskBody<V, E>,
    },
    Running {
        waiters: SmallVec<[oneshot::Sender<TaskOutcome<V, E>>; 2]>,
        abort: Option<tokio::task::AbortHandle>,
    },
    Finished(TaskOutcome<V, E>),
}

struct TaskCore<V, E> {
    id: TaskId,
    configuration: TaskConfiguration,
    phase: AtomicCell<TaskPhase>,
    cancelled: AtomicBool,
    dependencies: Mutex<Vec<TaskHandle>>,
    lifecycle: Mutex<TaskLifecycle<V, E>>,
}

/// A lazy, cancellable, one-shot asynchronous unit with shared completion.
pub struct OperationTask<V, E> {
    core: Arc<TaskCore<V, E>>,
}

impl<V, E> Clone for OperationTask<V, E> {
    fn clone(&self) -> Self {
        OperationTask {
            core: self.core.clone(),
        }
    }
}

impl<V, E> OperationTask<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a task that will run `body` at most once.
    pub fn new(
        configuration: TaskConfiguration,
        body: impl FnOnce(Context) -> BoxFuture<'static, TaskOutcome<V, E>> + Send + 'static,
    ) -> Self {
        Self::with_id(TaskId::next(), configuration, body)
    }

    pub(crate) fn with_id(
        id: TaskId,
        configuration: TaskConfiguration,
        body: impl FnOnce(Context) -> BoxFuture<'static, TaskOutcome<V, E>> + Send + 'static,
    ) -> Self {
        OperationTask {
            core: Arc::new(TaskCore {
                id,
                configuration,
                phase: AtomicCell::new(TaskPhase::Pending),
                cancelled: AtomicBool::new(false),
                dependencies: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(TaskLifecycle::Pending {
                    body: Box::new(body),
                }),
            }),
        }
    }

    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// The task's configuration.
    pub fn configuration(&self) -> &TaskConfiguration {
        &self.core.configuration
    }

    /// The task's human-readable name.
    pub fn name(&self) -> Arc<str> {
        self.core.configuration.name.clone()
    }

    /// True once the body has been handed to the runtime (or the task was
    /// cancelled/finished without ever starting).
    pub fn has_started(&self) -> bool {
        self.core.phase.load() != TaskPhase::Pending
    }

    /// True while the body is executing.
    pub fn is_running(&self) -> bool {
        self.core.phase.load() == TaskPhase::Running
    }

    /// True once an outcome is installed, including cancellation.
    pub fn is_finished(&self) -> bool {
        self.core.phase.load() == TaskPhase::Finished
    }

    /// True when the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.core.cancelled.load(Ordering::SeqCst)
    }

    /// Declares that `other` must be awaited before this task's body runs.
    ///
    /// Dependencies are best-effort: their failures are swallowed. Adding a
    /// dependency that (transitively) waits on this task is a programming
    /// error and aborts with a message naming the cycle.
    pub fn schedule_after<U, F>(&self, other: &OperationTask<U, F>)
    where
        U: Clone + Send + Sync + 'static,
        F: Clone + Send + Sync + 'static,
    {
        let handle = other.handle();
        let mut cycle = Vec::new();
        if find_dependency_path(self.id(), &handle, &mut cycle) {
            let mut names: Vec<String> = Vec::with_capacity(cycle.len() + 1);
            names.push(self.name().to_string());
            names.extend(cycle.iter().map(|name| name.to_string()));
            panic!(
                "circular task scheduling detected: {}",
                names.join(" -> ")
            );
        }
        if self.has_started() {
            log::warn!(
                "task {:?} was scheduled after {:?}, but it already started; \
                 the dependency has no effect",
                self.name(),
                other.name()
            );
        }
        self.core.dependencies.lock().push(handle);
    }

    /// The tasks scheduled before this one, in scheduling order.
    pub fn scheduled_before(&self) -> Vec<TaskHandle> {
        self.core.dependencies.lock().clone()
    }

    /// Runs the body if it never ran, joins the in-flight run if it is
    /// running, or returns the cached outcome if it already finished.
    pub async fn run_if_needed(&self) -> TaskOutcome<V, E> {
        match self.subscribe_or_start() {
            Ok(outcome) => outcome,
            Err(receiver) => match receiver.await {
                Ok(outcome) => outcome,
                // The producing half disappeared without installing an
                // outcome; the runtime tore the task down.
                Err(oneshot::Canceled) => Err(TaskError::Cancelled),
            },
        }
    }

    fn subscribe_or_start(&self) -> Result<TaskOutcome<V, E>, oneshot::Receiver<TaskOutcome<V, E>>> {
        let mut lifecycle = self.core.lifecycle.lock();
        match &mut *lifecycle {
            TaskLifecycle::Finished(outcome) => Ok(outcome.clone()),
            TaskLifecycle::Running { waiters, .. } => {
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                Err(receiver)
            }
            TaskLifecycle::Pending { .. } => {
                let replaced = std::mem::replace(
                    &mut *lifecycle,
                    TaskLifecycle::Running {
                        waiters: SmallVec::new(),
                        abort: None,
                    },
                );
                let body = match replaced {
                    TaskLifecycle::Pending { body } => body,
                    _ => unreachable!(),
                };
                let (sender, receiver) = oneshot::channel();
                if let TaskLifecycle::Running { waiters, .. } = &mut *lifecycle {
                    waiters.push(sender);
                }
                self.core.phase.store(TaskPhase::Running);

                log::debug!("task {:?} ({:?}): starting", self.name(), self.id());

                let core = self.core.clone();
                let context = self.core.configuration.context.clone();
                let join = tokio::spawn(async move {
                    let dependencies = core.dependencies.lock().clone();
                    for dependency in dependencies {
                        dependency.wait().await;
                    }
                    let outcome = body(context).await;
                    core.finish(outcome);
                });
                if let TaskLifecycle::Running { abort, .. } = &mut *lifecycle {
                    *abort = Some(join.abort_handle());
                }
                Err(receiver)
            }
        }
    }

    /// Cancels the task.
    ///
    /// A task that never started resolves every future `run_if_needed` with
    /// [`TaskError::Cancelled`] (and reports a diagnostic, since cancelling
    /// unstarted work usually indicates a scheduling mistake). A running
    /// task is aborted and every waiter is unblocked with `Cancelled`. A
    /// finished task is left alone.
    pub fn cancel(&self) {
        enum Action {
            None,
            NeverStarted,
            Abort(Option<tokio::task::AbortHandle>),
        }

        let action = {
            let mut lifecycle = self.core.lifecycle.lock();
            match &mut *lifecycle {
                TaskLifecycle::Finished(_) => Action::None,
                TaskLifecycle::Pending { .. } => {
                    self.core.cancelled.store(true, Ordering::SeqCst);
                    *lifecycle = TaskLifecycle::Finished(Err(TaskError::Cancelled));
                    self.core.phase.store(TaskPhase::Finished);
                    Action::NeverStarted
                }
                TaskLifecycle::Running { abort, .. } => {
                    self.core.cancelled.store(true, Ordering::SeqCst);
                    Action::Abort(abort.take())
                }
            }
        };

        match action {
            Action::None => {}
            Action::NeverStarted => {
                let reporter = self.core.configuration.context.get::<DiagnosticReporterKey>();
                reporter.report(&Diagnostic::CancelledBeforeStart { task: self.name() });
            }
            Action::Abort(abort) => {
                log::debug!("task {:?} ({:?}): cancelling", self.name(), self.id());
                self.core.finish(Err(TaskError::Cancelled));
                if let Some(abort) = abort {
                    abort.abort();
                }
            }
        }
    }

    /// A task resolving with `f` applied to this task's value. Awaiting the
    /// derived task runs this task first.
    pub fn map<U>(&self, f: impl FnOnce(V) -> U + Send + 'static) -> OperationTask<U, E>
    where
        U: Clone + Send + Sync + 'static,
    {
        let source = self.clone();
        let configuration = TaskConfiguration {
            name: format!("{} (mapped)", self.name()).into(),
            context: self.core.configuration.context.clone(),
        };
        OperationTask::new(configuration, move |_context| {
            async move { source.run_if_needed().await.map(f) }.boxed()
        })
    }

    /// A type-erased control handle for this task.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle(Arc::new(self.clone()))
    }
}

impl<V, E> TaskCore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Installs the outcome and unblocks every waiter. The first outcome
    /// wins; later calls are no-ops.
    fn finish(&self, outcome: TaskOutcome<V, E>) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, TaskLifecycle::Finished(_)) {
            return;
        }
        let previous = std::mem::replace(&mut *lifecycle, TaskLifecycle::Finished(outcome.clone()));
        self.phase.store(TaskPhase::Finished);
        drop(lifecycle);

        if let TaskLifecycle::Running { waiters, .. } = previous {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

impl<V, E> fmt::Debug for OperationTask<V, E> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("OperationTask")
            .field("id", &self.core.id)
            .field("name", &self.core.configuration.name)
            .field("phase", &self.core.phase.load())
            .finish()
    }
}

trait ErasedTask: Send + Sync {
    fn id(&self) -> TaskId;
    fn name(&self) -> Arc<str>;
    fn has_started(&self) -> bool;
    fn is_finished(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn cancel(&self);
    fn wait(&self) -> BoxFuture<'static, ()>;
    fn dependencies(&self) -> Vec<TaskHandle>;
}

impl<V, E> ErasedTask for OperationTask<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn id(&self) -> TaskId {
        OperationTask::id(self)
    }

    fn name(&self) -> Arc<str> {
        OperationTask::name(self)
    }

    fn has_started(&self) -> bool {
        OperationTask::has_started(self)
    }

    fn is_finished(&self) -> bool {
        OperationTask::is_finished(self)
    }

    fn is_cancelled(&self) -> bool {
        OperationTask::is_cancelled(self)
    }

    fn cancel(&self) {
        OperationTask::cancel(self)
    }

    fn wait(&self) -> BoxFuture<'static, ()> {
        let task = self.clone();
        async move {
            let _ = task.run_if_needed().await;
        }
        .boxed()
    }

    fn dependencies(&self) -> Vec<TaskHandle> {
        self.core.dependencies.lock().clone()
    }
}

/// A type-erased handle to some [`OperationTask`], exposing its latch and
/// cancellation but not its typed outcome.
#[derive(Clone)]
pub struct TaskHandle(Arc<dyn ErasedTask>);

impl TaskHandle {
    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    /// The task's human-readable name.
    pub fn name(&self) -> Arc<str> {
        self.0.name()
    }

    /// See [`OperationTask::has_started`].
    pub fn has_started(&self) -> bool {
        self.0.has_started()
    }

    /// See [`OperationTask::is_finished`].
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// See [`OperationTask::is_cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Cancels the underlying task.
    pub fn cancel(&self) {
        self.0.cancel()
    }

    pub(crate) fn wait(&self) -> BoxFuture<'static, ()> {
        self.0.wait()
    }

    fn dependencies(&self) -> Vec<TaskHandle> {
        self.0.dependencies()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Depth-first walk over `from`'s dependency closure looking for `target`;
/// on success `path` holds the names along the dependency chain.
fn find_dependency_path(target: TaskId, from: &TaskHandle, path: &mut Vec<Arc<str>>) -> bool {
    path.push(from.name());
    if from.id() == target {
        return true;
    }
    for dependency in from.dependencies() {
        if find_dependency_path(target, &dependency, path) {
            return true;
        }
    }
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn configuration(name: &str) -> TaskConfiguration {
        TaskConfiguration {
            name: name.into(),
            context: Context::new(),
        }
    }

    fn counting_task(
        name: &str,
        runs: &Arc<AtomicUsize>,
        value: u32,
    ) -> OperationTask<u32, String> {
        let runs = runs.clone();
        OperationTask::new(configuration(name), move |_context| {
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn body_runs_exactly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("once", &runs, 7);

        assert!(!task.has_started());
        assert_eq!(task.run_if_needed().await, Ok(7));
        assert_eq!(task.run_if_needed().await, Ok(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
        assert!(!task.is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_waiters_observe_the_same_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_body = runs.clone();
        let task = OperationTask::<u32, String>::new(configuration("shared"), move |_context| {
            async move {
                runs_in_body.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(42)
            }
            .boxed()
        });

        let (a, b) = tokio::join!(task.run_if_needed(), task.run_if_needed());
        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_start_rejects_with_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("unstarted", &runs, 1);

        task.cancel();
        assert!(task.is_cancelled());
        assert!(task.is_finished());
        assert_eq!(task.run_if_needed().await, Err(TaskError::Cancelled));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_while_running_unblocks_waiters() {
        let task = OperationTask::<u32, String>::new(configuration("slow"), |_context| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            }
            .boxed()
        });

        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.run_if_needed().await })
        };
        // Give the body time to start before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(task.is_running());
        task.cancel();

        assert_eq!(waiter.await.unwrap(), Err(TaskError::Cancelled));
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn dependencies_run_first_and_failures_are_swallowed() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let failing = {
            let order = order.clone();
            OperationTask::<u32, String>::new(configuration("failing dependency"), move |_c| {
                async move {
                    order.lock().push("dependency");
                    Err(TaskError::Failure("boom".to_owned()))
                }
                .boxed()
            })
        };
        let main = {
            let order = order.clone();
            OperationTask::<u32, String>::new(configuration("main"), move |_c| {
                async move {
                    order.lock().push("main");
                    Ok(3)
                }
                .boxed()
            })
        };

        main.schedule_after(&failing);
        assert_eq!(main.run_if_needed().await, Ok(3));
        assert_eq!(*order.lock(), vec!["dependency", "main"]);
        assert!(failing.is_finished());
    }

    #[tokio::test]
    #[should_panic(expected = "circular task scheduling detected")]
    async fn circular_scheduling_is_fatal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let a = counting_task("task a", &runs, 1);
        let b = counting_task("task b", &runs, 2);
        a.schedule_after(&b);
        b.schedule_after(&a);
    }

    #[tokio::test]
    async fn map_runs_the_source_and_transforms() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task("source", &runs, 10);
        let doubled = task.map(|value| value * 2);

        assert_eq!(doubled.run_if_needed().await, Ok(20));
        assert!(task.is_finished());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn map_propagates_failures() {
        let task = OperationTask::<u32, String>::new(configuration("failing"), |_c| {
            async { Err(TaskError::Failure("nope".to_owned())) }.boxed()
        });
        let mapped = task.map(|value| value + 1);
        assert_eq!(
            mapped.run_if_needed().await,
            Err(TaskError::Failure("nope".to_owned()))
        );
    }
}
