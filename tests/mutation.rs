//! Mutation runtime behavior: argument history, retry-latest and events.

mod common;

use chutney::{
    path, BoxFuture, Context, EventHandler, HistoryLimitKey, MutateError, Mutating,
    MutationOperation, MutationState, OperationClient, OperationContinuation, OperationState,
    Path, TaskError,
};
use common::wait_until;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type State = MutationState<String, String, String>;

/// Echoes its arguments, recording every call.
struct Rename {
    path: Path,
    calls: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicUsize>,
    delay: Duration,
}

impl Rename {
    fn new(path: Path) -> Self {
        Rename {
            path,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }
}

impl MutationOperation for Rename {
    type Arguments = String;
    type Output = String;
    type Failure = String;

    fn path(&self) -> Path {
        self.path.clone()
    }

    fn mutate(
        self: Arc<Self>,
        arguments: String,
        _context: Context,
        _continuation: OperationContinuation<State>,
    ) -> BoxFuture<'static, Result<String, String>> {
        let calls = self.calls.clone();
        let fail = self.fail.clone();
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            calls.lock().push(arguments.clone());
            if fail.load(Ordering::SeqCst) > 0 {
                fail.fetch_sub(1, Ordering::SeqCst);
                return Err(format!("could not rename to {arguments}"));
            }
            Ok(format!("renamed to {arguments}"))
        }
        .boxed()
    }
}

#[tokio::test]
async fn mutate_then_retry_latest_reuses_the_arguments() {
    let operation = Rename::new(path!["rename"]);
    let calls = operation.calls.clone();
    let client = OperationClient::new();
    let store = client.store_for(Mutating::new(operation));

    let output = store.mutate("blob".to_owned()).await;
    assert_eq!(output, Ok("renamed to blob".to_owned()));

    let retried = store.retry_latest().await;
    assert_eq!(retried, Ok("renamed to blob".to_owned()));

    assert_eq!(*calls.lock(), vec!["blob".to_owned(), "blob".to_owned()]);
    let state = store.current_state();
    assert_eq!(state.history().len(), 2);
    assert!(state
        .history()
        .iter()
        .all(|attempt| attempt.arguments == "blob"));
    assert!(state
        .history()
        .iter()
        .all(|attempt| attempt.ended_at.is_some()));
    assert_eq!(state.last_value(), Some(&"renamed to blob".to_owned()));
}

#[tokio::test]
async fn retry_latest_without_history_fails_immediately() {
    let operation = Rename::new(path!["fresh rename"]);
    let calls = operation.calls.clone();
    let client = OperationClient::new();
    let store = client.store_for(Mutating::new(operation));

    let outcome = store.retry_latest().await;
    assert_eq!(outcome, Err(MutateError::NoPreviousArguments));
    assert!(calls.lock().is_empty());
    assert!(store.current_state().history().is_empty());
}

#[tokio::test]
async fn concurrent_mutations_never_share_a_task() {
    let mut operation = Rename::new(path!["parallel rename"]);
    operation.delay = Duration::from_millis(20);
    let calls = operation.calls.clone();
    let client = OperationClient::new();
    let store = client.store_for(Mutating::new(operation));

    let (a, b) = tokio::join!(
        store.mutate("one".to_owned()),
        store.mutate("one".to_owned())
    );
    a.unwrap();
    b.unwrap();
    // Equal arguments still mean two executions: identity, not equality.
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(store.current_state().history().len(), 2);
}

#[tokio::test]
async fn failed_mutations_record_their_error() {
    let operation = Rename::new(path!["failing rename"]);
    operation.fail.store(1, Ordering::SeqCst);
    let client = OperationClient::new();
    let store = client.store_for(Mutating::new(operation));

    let outcome = store.mutate("x".to_owned()).await;
    assert_eq!(
        outcome,
        Err(TaskError::Failure("could not rename to x".to_owned()))
    );
    let state = store.current_state();
    assert_eq!(state.error(), Some(&"could not rename to x".to_owned()));
    assert_eq!(
        state.history()[0].result,
        Some(Err("could not rename to x".to_owned()))
    );

    // retry_latest re-runs the same arguments and clears the error.
    let retried = store.retry_latest().await;
    assert_eq!(retried, Ok("renamed to x".to_owned()));
    assert!(store.current_state().error().is_none());
}

#[tokio::test]
async fn mutation_events_carry_the_arguments() {
    let operation = Rename::new(path!["evented rename"]);
    let client = OperationClient::new();
    let store = client.store_for(Mutating::new(operation));

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let _subscription = store.subscribe(
        EventHandler::new()
            .on_mutating_started({
                let log = log.clone();
                move |arguments, _| log.lock().push(format!("started {arguments}"))
            })
            .on_mutation_result_received({
                let log = log.clone();
                move |arguments, result, _| {
                    log.lock()
                        .push(format!("result {arguments} {}", result.is_ok()))
                }
            })
            .on_mutating_ended({
                let log = log.clone();
                move |arguments, _| log.lock().push(format!("ended {arguments}"))
            }),
    );

    store.mutate("pic".to_owned()).await.unwrap();
    wait_until(|| log.lock().len() >= 3).await;
    assert_eq!(
        *log.lock(),
        vec![
            "started pic".to_owned(),
            "result pic true".to_owned(),
            "ended pic".to_owned(),
        ]
    );
}

#[tokio::test]
async fn history_limit_caps_retained_attempts() {
    let operation = Rename::new(path!["capped rename"]);
    let client = OperationClient::builder()
        .configure_context(|context| context.insert::<HistoryLimitKey>(Some(2)))
        .build();
    let store = client.store_for(Mutating::new(operation));

    for name in ["a", "b", "c", "d"] {
        store.mutate(name.to_owned()).await.unwrap();
    }
    let state = store.current_state();
    assert_eq!(state.history().len(), 2);
    assert_eq!(state.history()[0].arguments, "c");
    assert_eq!(state.history()[1].arguments, "d");
    assert_eq!(state.last_arguments(), Some("d".to_owned()));
}
