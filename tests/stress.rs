//! Concurrency stress: many tasks hammering one client with runs, resets,
//! subscriptions and mutations, checking that the shared-state invariants
//! hold throughout.

use chutney::{
    path, BoxFuture, Context, EventHandler, FetchOperation, OperationClient,
    OperationContinuation, OperationExt, OperationState, Path, Single, SingleState, TaskError,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const N_WORKERS: usize = 8;
const N_OPS_PER_WORKER: u64 = 60;

struct Jittery {
    path: Path,
    runs: Arc<AtomicUsize>,
}

impl FetchOperation for Jittery {
    type Value = u64;
    type Failure = String;

    fn path(&self) -> Path {
        self.path.clone()
    }

    fn fetch(
        self: Arc<Self>,
        _context: Context,
        _continuation: OperationContinuation<SingleState<u64, String>>,
    ) -> BoxFuture<'static, Result<u64, String>> {
        let runs = self.runs.clone();
        async move {
            let run = runs.fetch_add(1, Ordering::SeqCst) as u64;
            if run % 7 == 0 {
                tokio::time::sleep(Duration::from_millis(run % 3)).await;
            }
            Ok(run)
        }
        .boxed()
    }
}

#[derive(Clone, Copy, Debug)]
enum StressOp {
    Run,
    Subscribe,
    Reset,
    SetResult(u64),
    Snapshot,
}

fn op_for(step: u64) -> StressOp {
    match step % 11 {
        0 => StressOp::Reset,
        1 | 4 => StressOp::Subscribe,
        2 => StressOp::SetResult(step),
        3 | 6 | 9 => StressOp::Snapshot,
        _ => StressOp::Run,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_shared_store_operations() {
    let runs = Arc::new(AtomicUsize::new(0));
    let client = OperationClient::new();
    let store = client.store_for(
        Single::new(Jittery {
            path: path!["stress"],
            runs: runs.clone(),
        })
        .disable_automatic_running()
        .deduplicated(),
    );

    let observed_updates = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for worker in 0..N_WORKERS {
        let store = store.clone();
        let observed_updates = observed_updates.clone();
        workers.push(tokio::spawn(async move {
            let mut rng = oorandom::Rand64::new(worker as u128 + 1);
            let mut subscriptions = Vec::new();
            for step in 0..N_OPS_PER_WORKER {
                match op_for(rng.rand_u64() ^ step) {
                    StressOp::Run => match store.run(None).await {
                        Ok(_) | Err(TaskError::Cancelled) => {}
                        Err(TaskError::Failure(error)) => {
                            panic!("the stress operation never fails: {error}")
                        }
                    },
                    StressOp::Subscribe => {
                        let observed_updates = observed_updates.clone();
                        subscriptions.push(store.subscribe(
                            EventHandler::new().on_state_changed(move |state: &SingleState<u64, String>, _| {
                                observed_updates
                                    .lock()
                                    .push(state.stamps().value_update_count());
                            }),
                        ));
                        if subscriptions.len() > 3 {
                            subscriptions.remove(0).cancel();
                        }
                    }
                    StressOp::Reset => store.reset_state(),
                    StressOp::SetResult(value) => store.set_result(Ok(value)),
                    StressOp::Snapshot => {
                        let state = store.current_state();
                        // A started-task-free state is never loading.
                        if state.active_tasks().iter().all(|task| !task.has_started()) {
                            assert!(!state.is_loading());
                        }
                    }
                }
            }
            drop(subscriptions);
        }));
    }

    for worker in workers {
        worker.await.expect("stress worker panicked");
    }

    // Quiesce: whatever was in flight when the last reset happened.
    let _ = store.run(None).await;
    assert!(!store.current_state().active_tasks().is_empty() || !store.status().is_loading());
    assert_eq!(store.subscriber_count(), 0);
    assert!(runs.load(Ordering::SeqCst) > 0);
}
