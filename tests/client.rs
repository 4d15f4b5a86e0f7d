//! Client behavior: store sharing, path queries, bulk edits, duplicate
//! paths and memory-pressure eviction.

mod common;

use chutney::{
    path, BoxFuture, Context, DefaultStoreCache, DiagnosticReporterKey, EventHandler,
    FetchOperation, MemoryPressure, OperationClient, OperationClientKey, OperationContinuation,
    OperationExt, OperationState, Path, Single, SingleState,
};
use common::{CollectingReporter, TestPressureSource};
use futures_util::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A fetch returning a fixed number, counting executions.
struct Counter {
    path: Path,
    value: u32,
    runs: Arc<AtomicUsize>,
}

impl Counter {
    fn new(path: Path, value: u32) -> Self {
        Counter {
            path,
            value,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FetchOperation for Counter {
    type Value = u32;
    type Failure = String;

    fn path(&self) -> Path {
        self.path.clone()
    }

    fn fetch(
        self: Arc<Self>,
        _context: Context,
        _continuation: OperationContinuation<SingleState<u32, String>>,
    ) -> BoxFuture<'static, Result<u32, String>> {
        let value = self.value;
        let runs = self.runs.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
        .boxed()
    }
}

/// A second operation type for the duplicate-path diagnostic.
struct Conflicting {
    path: Path,
}

impl FetchOperation for Conflicting {
    type Value = String;
    type Failure = String;

    fn path(&self) -> Path {
        self.path.clone()
    }

    fn fetch(
        self: Arc<Self>,
        _context: Context,
        _continuation: OperationContinuation<SingleState<String, String>>,
    ) -> BoxFuture<'static, Result<String, String>> {
        async { Ok("conflicting".to_owned()) }.boxed()
    }
}

fn quiet_counter(path: Path, value: u32) -> impl chutney::Operation<State = SingleState<u32, String>> {
    Single::new(Counter::new(path, value)).disable_automatic_running()
}

#[tokio::test]
async fn the_same_path_shares_one_store() {
    let client = OperationClient::new();
    let first = client.store_for(quiet_counter(path!["users", 1_u64], 1));
    let second = client.store_for(quiet_counter(path!["users", 1_u64], 1));

    first.set_result(Ok(9));
    assert_eq!(second.current_state().value(), Some(&9));
    assert_eq!(second.subscriber_count(), first.subscriber_count());
}

#[tokio::test]
async fn duplicate_paths_with_different_types_detach() {
    let reporter = CollectingReporter::new();
    let client = OperationClient::builder()
        .configure_context({
            let reporter = reporter.clone();
            move |context| context.insert::<DiagnosticReporterKey>(Arc::new(reporter))
        })
        .build();

    let registered = client.store_for(quiet_counter(path!["shared"], 1));
    let detached = client.store_for(
        Single::new(Conflicting {
            path: path!["shared"],
        })
        .disable_automatic_running(),
    );

    let reported = reporter.reported();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].contains("duplicate path"));

    // The detached store still works, but sharing is lost.
    assert_eq!(detached.run(None).await, Ok("conflicting".to_owned()));
    assert!(registered.current_state().value().is_none());
    assert_eq!(client.stores_matching(&path!["shared"]).len(), 1);
}

#[tokio::test]
async fn prefix_queries_and_type_filters() {
    let client = OperationClient::new();
    let _users_1 = client.store_for(quiet_counter(path!["users", 1_u64], 1));
    let _users_2 = client.store_for(quiet_counter(path!["users", 2_u64], 2));
    let _post = client.store_for(
        Single::new(Conflicting {
            path: path!["posts", 1_u64],
        })
        .disable_automatic_running(),
    );

    assert_eq!(client.stores_matching(&path!["users"]).len(), 2);
    assert_eq!(client.stores_matching(&Path::new()).len(), 3);

    let typed = client.stores_matching_of::<SingleState<u32, String>>(&Path::new());
    assert_eq!(typed.len(), 2);
    let strings = client.stores_matching_of::<SingleState<String, String>>(&Path::new());
    assert_eq!(strings.len(), 1);
}

#[tokio::test]
async fn bulk_edit_reconciles_by_diff() {
    let client = OperationClient::new();
    let _users_1 = client.store_for(quiet_counter(path!["users", 1_u64], 1));
    let _users_2 = client.store_for(quiet_counter(path!["users", 2_u64], 2));

    let removed = client.with_stores_matching(&path!["users"], |stores| {
        let removed = stores.remove(&path!["users", 1_u64]);
        removed.is_some()
    });
    assert!(removed);
    assert_eq!(client.stores_matching(&path!["users"]).len(), 1);
    assert!(client
        .stores_matching(&path!["users", 2_u64])
        .first()
        .is_some());
}

#[tokio::test]
async fn cleared_stores_are_recreated_fresh() {
    let client = OperationClient::new();
    let store = client.store_for(quiet_counter(path!["volatile"], 1));
    store.set_result(Ok(5));

    client.clear_store(&path!["volatile"]);
    let fresh = client.store_for(quiet_counter(path!["volatile"], 1));
    assert!(fresh.current_state().value().is_none());
    assert_eq!(fresh.current_state().stamps().value_update_count(), 0);

    // And the old handle keeps working, detached from the registry.
    assert_eq!(store.current_state().value(), Some(&5));
}

#[tokio::test]
async fn memory_pressure_evicts_only_idle_consenting_stores() {
    let source = TestPressureSource::new();
    let client = OperationClient::builder()
        .store_cache(Arc::new(DefaultStoreCache::with_memory_pressure_source(
            &source,
        )))
        .build();

    let idle = client.store_for(quiet_counter(path!["idle"], 1));
    idle.set_result(Ok(1));
    let watched = client.store_for(quiet_counter(path!["watched"], 2));
    let _subscription = watched.subscribe(EventHandler::new());

    source.emit(MemoryPressure::Warning);

    let remaining = client.stores_matching(&Path::new());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].path(), &path!["watched"]);

    // The evicted path is recreated from scratch on the next request.
    let recreated = client.store_for(quiet_counter(path!["idle"], 1));
    assert!(recreated.current_state().value().is_none());
}

#[tokio::test]
async fn normal_pressure_and_subscribers_block_eviction() {
    let source = TestPressureSource::new();
    let client = OperationClient::builder()
        .store_cache(Arc::new(DefaultStoreCache::with_memory_pressure_source(
            &source,
        )))
        .build();

    let store = client.store_for(quiet_counter(path!["sticky"], 1));
    source.emit(MemoryPressure::Normal);
    assert_eq!(client.stores_matching(&Path::new()).len(), 1);

    let subscription = store.subscribe(EventHandler::new());
    source.emit(MemoryPressure::Critical);
    assert_eq!(client.stores_matching(&Path::new()).len(), 1);

    subscription.cancel();
    source.emit(MemoryPressure::Critical);
    assert!(client.stores_matching(&Path::new()).is_empty());
}

#[tokio::test]
async fn contexts_carry_a_weak_client_back_reference() {
    let client = OperationClient::new();
    let store = client.store_for(quiet_counter(path!["linked"], 1));

    let weak = store
        .context()
        .get::<OperationClientKey>()
        .expect("client reference is installed");
    let upgraded = weak.upgrade().expect("client is alive");
    assert!(Arc::ptr_eq(&upgraded, &client));

    drop(client);
    drop(upgraded);
    assert!(store
        .context()
        .get::<OperationClientKey>()
        .unwrap()
        .upgrade()
        .is_none());
}

#[tokio::test]
async fn observe_returns_the_shared_store_and_attaches() {
    let client = OperationClient::new();
    let (store, subscription) =
        client.observe(quiet_counter(path!["observed"], 3), EventHandler::new());
    assert_eq!(store.subscriber_count(), 1);

    let again = client.store_for(quiet_counter(path!["observed"], 3));
    assert_eq!(again.subscriber_count(), 1);
    subscription.cancel();
    assert_eq!(again.subscriber_count(), 0);
}
