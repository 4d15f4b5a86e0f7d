#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The chutney crate is a client-side runtime for asynchronous operations.
//! It coordinates execution, caching, deduplication, retry, pagination and
//! live subscription of async work (typically remote reads, mutations and
//! paginated reads) on behalf of an application layer, so that every
//! surface asking for the same result shares one in-flight request and one
//! cached state.
//!
//! The pieces fit together like this: the application describes work as
//! [`Operation`] values — pure descriptors with a stable [`Path`] identity
//! and a typed state. The [`OperationClient`] is the process-wide registry
//! that hands out a shared [`OperationStore`] per path. The store is the
//! live state machine: subscribers attach to it, it schedules
//! [`OperationTask`]s to execute the operation, deduplicates in-flight
//! work per intent, applies retries with [`Backoff`] through a [`Delayer`],
//! records results into its [`OperationState`], and fans events out to
//! every subscriber. Operations compose through the modifier pipeline
//! ([`OperationExt`]): `op.retry(3).deduplicated().backoff(...)`.
//!
//! ```no_run
//! use chutney::{
//!     path, BoxFuture, Context, EventHandler, FetchOperation, OperationClient,
//!     OperationContinuation, OperationExt, Path, Single, SingleState,
//! };
//! use futures_util::FutureExt;
//! use std::sync::Arc;
//!
//! struct UserName {
//!     id: u64,
//! }
//!
//! impl FetchOperation for UserName {
//!     type Value = String;
//!     type Failure = String;
//!
//!     fn path(&self) -> Path {
//!         path!["users", self.id, "name"]
//!     }
//!
//!     fn fetch(
//!         self: Arc<Self>,
//!         _context: Context,
//!         _continuation: OperationContinuation<SingleState<String, String>>,
//!     ) -> BoxFuture<'static, Result<String, String>> {
//!         async { Ok("blob".to_owned()) }.boxed()
//!     }
//! }
//!
//! # async fn example() {
//! let client = OperationClient::new();
//! let store = client.store_for(Single::new(UserName { id: 1 }).retry(2));
//! let _subscription = store.subscribe(
//!     EventHandler::new().on_state_changed(|state: &SingleState<String, String>, _context| {
//!         println!("name: {:?}", state.value());
//!     }),
//! );
//! let name = store.run(None).await;
//! # let _ = name;
//! # }
//! ```

mod backoff;
mod client;
mod context;
mod fetch;
mod modifier;
mod mutation;
mod paginated;
mod path;
mod run_spec;
mod sources;
mod state;
mod store;
mod subscription;
mod task;
mod time;

pub use crate::backoff::{Backoff, BackoffKey, MaxRetriesKey, RetryIndexKey};
pub use crate::client::{
    downcast_store, CachedStore, DefaultStoreCache, DefaultStoreCreator, OpaqueStore,
    OperationClient, OperationClientBuilder, OperationClientKey, StoreCache, StoreCreator,
    WeakClient,
};
pub use crate::context::{Context, ContextKey};
pub use crate::fetch::{FetchOperation, Single};
pub use crate::modifier::{
    Alerts, CompletelyOffline, ControlledBy, Deduplicated, DefaultValue,
    DisableApplicationActiveRerunning, DisableAutomaticRunning, EnableAutomaticRunning,
    EvictWhen, LogDuration, Modified, OperationExt, OperationModifier, PreviewDelay, PreviewKey,
    RerunOnChange, RetryLimit, WithBackoff,
};
pub use crate::mutation::{
    HistoryLimitKey, MutateError, Mutating, MutationArgumentsKey, MutationAttempt, MutationEvent,
    MutationIntent, MutationOperation, MutationSerialKey, MutationState,
};
pub use crate::paginated::{
    Page, PageContinuation, PageEvent, PageFetchOutcome, PageIntent, PageRequestKey, Paginated,
    PaginatedOperation, PaginatedState, Pages,
};
pub use crate::path::{Path, PathElement, PathValue, PathableCollection};
pub use crate::run_spec::{
    all, always, any, AutomaticRunningKey, NetworkConnectedSpecification,
    NotificationSpecification, OnSpecificationChange, RunSpecification, RunSpecifications,
    RunSpecificationsKey, APPLICATION_ACTIVE_LABEL, APPLICATION_ACTIVE_NOTIFICATION,
    NETWORK_CONNECTED_LABEL,
};
pub use crate::sources::{
    AlertMessage, AlertSink, AlertSinkKey, Diagnostic, DiagnosticReporter, DiagnosticReporterKey,
    DynAlertSink,
    DynNetworkObserver, DynNotificationSource, EvictableMemoryPressureKey, HttpRequest,
    HttpResponseMetadata, HttpTransport, LogReporter, MemoryPressure, MemoryPressureSet,
    MemoryPressureSource, NetworkObserverKey, NetworkStatus, NetworkStatusObserver, Notification,
    NotificationSource, NotificationSourceKey,
};
pub use crate::state::{
    NoEvent, OperationIntent, OperationKind, OperationState, OperationStatus,
    ResultUpdateReasonKey, SingleIntent, SingleState, UpdateReason, UpdateStamps,
};
pub use crate::store::{
    AlertConfiguration, AlertsKey, Controllers, ControllersKey, DeduplicationKey, EventHandler,
    FailureOf, Operation, OperationContinuation, OperationController, OperationControls,
    OperationStore, RetryPredicate, RetryPredicateKey, RunOutputOf, RunResult,
};
pub use crate::subscription::Subscription;
pub use crate::task::{
    OperationTask, TaskConfiguration, TaskError, TaskHandle, TaskId, TaskNameKey, TaskOutcome,
};
pub use crate::time::{Clock, ClockKey, Delayer, DelayerKey, SystemClock, TokioDelayer};

/// A boxed, sendable future, as returned by operation bodies and the
/// capability traits.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
