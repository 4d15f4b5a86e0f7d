//! The process-wide registry of stores.
//!
//! An [`OperationClient`] owns a [`StoreCache`] keyed by [`Path`] and a
//! [`StoreCreator`] that seeds per-kind context defaults into every store
//! it creates. Stores are shared: every `store_for` call with the same
//! path observes the same store, and the cache evicts subscriber-less
//! stores under memory pressure.

use crate::backoff::{Backoff, BackoffKey, MaxRetriesKey};
use crate::context::{Context, ContextKey};
use crate::path::{Path, PathableCollection};
use crate::run_spec::AutomaticRunningKey;
use crate::sources::{
    Diagnostic, DiagnosticReporterKey, EvictableMemoryPressureKey, MemoryPressure,
    MemoryPressureSet, MemoryPressureSource,
};
use crate::state::{OperationKind, OperationState};
use crate::store::{DeduplicationKey, EventHandler, Operation, OperationStore};
use crate::subscription::Subscription;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The type-erased face of a store held by the cache.
pub trait OpaqueStore: Send + Sync + 'static {
    /// The store's path.
    fn path(&self) -> &Path;

    /// How many subscribers are attached.
    fn subscriber_count(&self) -> usize;

    /// Whether this store may be evicted under `level`.
    fn is_evictable_under(&self, level: MemoryPressure) -> bool;

    /// The name of the store's state type, for diagnostics.
    fn state_type_name(&self) -> &'static str;

    /// Upcast used by the downcast helper.
    fn as_any(&self) -> &dyn Any;
}

impl<S: OperationState> OpaqueStore for OperationStore<S> {
    fn path(&self) -> &Path {
        OperationStore::path(self)
    }

    fn subscriber_count(&self) -> usize {
        OperationStore::subscriber_count(self)
    }

    fn is_evictable_under(&self, level: MemoryPressure) -> bool {
        self.context().get::<EvictableMemoryPressureKey>().contains(level)
    }

    fn state_type_name(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recovers a typed store from an opaque one, verifying the state type.
pub fn downcast_store<S: OperationState>(store: &Arc<dyn OpaqueStore>) -> Option<OperationStore<S>> {
    store.as_any().downcast_ref::<OperationStore<S>>().cloned()
}

/// A cache entry: the erased store plus the identity of the operation type
/// it was registered under.
#[derive(Clone)]
pub struct CachedStore {
    store: Arc<dyn OpaqueStore>,
    operation_type: TypeId,
    operation_type_name: &'static str,
}

impl CachedStore {
    /// Builds an entry for `store`, registered under operation type `Op`.
    pub fn new<Op: Operation>(store: OperationStore<Op::State>) -> Self {
        CachedStore {
            store: Arc::new(store),
            operation_type: TypeId::of::<Op>(),
            operation_type_name: std::any::type_name::<Op>(),
        }
    }

    /// The erased store.
    pub fn store(&self) -> &Arc<dyn OpaqueStore> {
        &self.store
    }

    /// The typed store, when `S` matches.
    pub fn downcast<S: OperationState>(&self) -> Option<OperationStore<S>> {
        downcast_store(&self.store)
    }
}

impl fmt::Debug for CachedStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CachedStore")
            .field("path", self.store.path())
            .field("operation", &self.operation_type_name)
            .finish()
    }
}

/// Storage for the client's stores. All mutating access happens under the
/// implementation's lock, through `with_stores`.
pub trait StoreCache: Send + Sync + 'static {
    /// Runs `f` with exclusive access to the store collection.
    fn with_stores(&self, f: &mut dyn FnMut(&mut PathableCollection<CachedStore>));
}

/// The default [`StoreCache`]: an in-memory collection that, when given a
/// [`MemoryPressureSource`], evicts subscriber-less stores whose context
/// opted into eviction at the signalled level.
pub struct DefaultStoreCache {
    stores: Arc<Mutex<PathableCollection<CachedStore>>>,
    _pressure_subscription: Option<Subscription>,
}

impl DefaultStoreCache {
    /// A cache with no memory-pressure integration.
    pub fn new() -> Self {
        DefaultStoreCache {
            stores: Arc::new(Mutex::new(PathableCollection::<CachedStore>::new())),
            _pressure_subscription: None,
        }
    }

    /// A cache that subscribes to `source` and evicts on warning and
    /// critical signals. Eviction never touches stores with subscribers,
    /// and never cancels in-flight tasks still referenced elsewhere.
    pub fn with_memory_pressure_source(source: &dyn MemoryPressureSource) -> Self {
        let stores = Arc::new(Mutex::new(PathableCollection::<CachedStore>::new()));
        let weak = Arc::downgrade(&stores);
        let subscription = source.subscribe(Box::new(move |level| {
            if level == MemoryPressure::Normal {
                return;
            }
            let Some(stores) = weak.upgrade() else {
                return;
            };
            let mut stores = stores.lock();
            let evictable: Vec<Path> = stores
                .iter()
                .filter(|(_, entry)| {
                    entry.store().subscriber_count() == 0
                        && entry.store().is_evictable_under(level)
                })
                .map(|(path, _)| path.clone())
                .collect();
            for path in evictable {
                log::debug!("memory pressure {level:?}: evicting store {path:?}");
                stores.remove(&path);
            }
        }));
        DefaultStoreCache {
            stores,
            _pressure_subscription: Some(subscription),
        }
    }
}

impl Default for DefaultStoreCache {
    fn default() -> Self {
        DefaultStoreCache::new()
    }
}

impl StoreCache for DefaultStoreCache {
    fn with_stores(&self, f: &mut dyn FnMut(&mut PathableCollection<CachedStore>)) {
        f(&mut self.stores.lock());
    }
}

/// Seeds the context every new store is created with. Substituting a
/// custom creator changes the defaults globally.
pub trait StoreCreator: Send + Sync + 'static {
    /// Prepares `context` for a store of the given kind. Runs before the
    /// operation's own `setup`, so operation modifiers win.
    fn prepare(&self, kind: OperationKind, context: &mut Context);
}

/// The default [`StoreCreator`]: deduplication everywhere; three retries
/// with exponential backoff from one second and automatic running for
/// single and paginated operations; no retries and no automatic running
/// for mutations; eviction under warning and critical pressure.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStoreCreator;

impl StoreCreator for DefaultStoreCreator {
    fn prepare(&self, kind: OperationKind, context: &mut Context) {
        context.insert::<DeduplicationKey>(true);
        context.insert::<EvictableMemoryPressureKey>(MemoryPressureSet::all());
        match kind {
            OperationKind::Single | OperationKind::Paginated => {
                context.insert::<MaxRetriesKey>(3);
                context.insert::<BackoffKey>(Backoff::exponential(Duration::from_secs(1)));
                context.insert::<AutomaticRunningKey>(true);
            }
            OperationKind::Mutation => {
                context.insert::<MaxRetriesKey>(0);
                context.insert::<AutomaticRunningKey>(false);
            }
        }
    }
}

/// A weak back-reference to the client, stored in every context so stores
/// can reach their registry without keeping it alive.
#[derive(Clone)]
pub struct WeakClient(Weak<OperationClient>);

impl WeakClient {
    /// The client, while it is still alive. Never upgrade while holding a
    /// store or cache lock.
    pub fn upgrade(&self) -> Option<Arc<OperationClient>> {
        self.0.upgrade()
    }
}

impl fmt::Debug for WeakClient {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "<client>")
    }
}

/// Context key for the weak client back-reference.
pub struct OperationClientKey;

impl ContextKey for OperationClientKey {
    type Value = Option<WeakClient>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "OperationClient"
    }
}

/// The process-wide registry of operation stores.
pub struct OperationClient {
    default_context: Context,
    cache: Arc<dyn StoreCache>,
    creator: Arc<dyn StoreCreator>,
}

/// Configures an [`OperationClient`].
pub struct OperationClientBuilder {
    context: Context,
    cache: Option<Arc<dyn StoreCache>>,
    creator: Option<Arc<dyn StoreCreator>>,
}

impl OperationClientBuilder {
    /// Substitutes the store cache.
    pub fn store_cache(mut self, cache: Arc<dyn StoreCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Substitutes the store creator.
    pub fn store_creator(mut self, creator: Arc<dyn StoreCreator>) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Edits the default context copied into every store.
    pub fn configure_context(mut self, edit: impl FnOnce(&mut Context)) -> Self {
        edit(&mut self.context);
        self
    }

    /// Builds the client. The client holds itself weakly in its default
    /// context, so `context.get::<OperationClientKey>()` resolves without
    /// creating a cycle.
    pub fn build(self) -> Arc<OperationClient> {
        Arc::new_cyclic(|weak| {
            let mut context = self.context;
            context.insert::<OperationClientKey>(Some(WeakClient(weak.clone())));
            OperationClient {
                default_context: context,
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(DefaultStoreCache::new())),
                creator: self.creator.unwrap_or_else(|| Arc::new(DefaultStoreCreator)),
            }
        })
    }
}

enum Lookup<S: OperationState> {
    Hit(OperationStore<S>),
    Mismatch(&'static str),
    Miss,
}

impl OperationClient {
    /// A client with the default cache, creator and context.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// A builder for customizing the client.
    pub fn builder() -> OperationClientBuilder {
        OperationClientBuilder {
            context: Context::new(),
            cache: None,
            creator: None,
        }
    }

    /// A copy of the default context.
    pub fn default_context(&self) -> Context {
        self.default_context.clone()
    }

    /// The shared store for `operation`, creating and registering it on
    /// first use.
    ///
    /// If the path is already registered under a *different* operation
    /// type, a duplicate-path diagnostic is reported and a fresh detached
    /// store is returned; the call still works, but sharing is lost for
    /// it.
    pub fn store_for<Op: Operation>(&self, operation: Op) -> OperationStore<Op::State> {
        let path = operation.path();
        let requested = TypeId::of::<Op>();

        let mut lookup: Lookup<Op::State> = Lookup::Miss;
        self.cache.with_stores(&mut |stores| {
            if let Some(entry) = stores.get(&path) {
                if entry.operation_type == requested {
                    if let Some(store) = entry.downcast::<Op::State>() {
                        lookup = Lookup::Hit(store);
                        return;
                    }
                }
                lookup = Lookup::Mismatch(entry.operation_type_name);
            }
        });

        match lookup {
            Lookup::Hit(store) => store,
            Lookup::Mismatch(existing) => {
                self.default_context
                    .get::<DiagnosticReporterKey>()
                    .report(&Diagnostic::DuplicatePath {
                        path,
                        existing,
                        requested: std::any::type_name::<Op>(),
                    });
                self.create_store(operation)
            }
            Lookup::Miss => {
                // Created outside the cache lock: store creation subscribes
                // to run specifications and controllers, which must not run
                // under the lock.
                let created = self.create_store(operation);
                let mut resolved = created.clone();
                self.cache.with_stores(&mut |stores| {
                    match stores.get(&path) {
                        // Another thread registered this path while we were
                        // creating; share theirs when the types agree.
                        Some(entry) => {
                            if entry.operation_type == requested {
                                if let Some(existing) = entry.downcast::<Op::State>() {
                                    resolved = existing;
                                }
                            }
                        }
                        None => {
                            stores.insert(
                                path.clone(),
                                CachedStore {
                                    store: Arc::new(created.clone()),
                                    operation_type: requested,
                                    operation_type_name: std::any::type_name::<Op>(),
                                },
                            );
                        }
                    }
                });
                resolved
            }
        }
    }

    /// Fetch-and-observe in one call: returns the shared store and a
    /// subscription for `handler`. This is the explicit observer handle
    /// that replaces reactive property bindings at the core's boundary.
    pub fn observe<Op: Operation>(
        &self,
        operation: Op,
        handler: EventHandler<Op::State>,
    ) -> (OperationStore<Op::State>, Subscription) {
        let store = self.store_for(operation);
        let subscription = store.subscribe(handler);
        (store, subscription)
    }

    /// Every registered store whose path starts with `path`, type-erased.
    pub fn stores_matching(&self, path: &Path) -> Vec<Arc<dyn OpaqueStore>> {
        let mut out = Vec::new();
        self.cache.with_stores(&mut |stores| {
            out = stores
                .matching(path)
                .map(|(_, entry)| entry.store().clone())
                .collect();
        });
        out
    }

    /// Every registered store under `path` whose state type is `S`;
    /// stores of other state types are dropped from the result.
    pub fn stores_matching_of<S: OperationState>(&self, path: &Path) -> Vec<OperationStore<S>> {
        let mut out = Vec::new();
        self.cache.with_stores(&mut |stores| {
            out = stores
                .matching(path)
                .filter_map(|(_, entry)| entry.downcast::<S>())
                .collect();
        });
        out
    }

    /// Scoped bulk edit: hands `f` a snapshot of the entries under `path`,
    /// then reconciles the cache by diff — entries `f` added are inserted,
    /// entries it removed are dropped.
    pub fn with_stores_matching<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut PathableCollection<CachedStore>) -> R,
    ) -> R {
        let mut f = Some(f);
        let mut out = None;
        self.cache.with_stores(&mut |stores| {
            let mut scoped = PathableCollection::new();
            for (entry_path, entry) in stores.matching(path) {
                scoped.insert(entry_path.clone(), entry.clone());
            }
            let f = f.take().expect("store cache invoked the callback twice");
            out = Some(f(&mut scoped));
            stores.reconcile(path, scoped);
        });
        out.expect("store cache did not invoke the callback")
    }

    /// Drops every cache entry whose path starts with `path`.
    pub fn clear_stores_matching(&self, path: &Path) {
        self.cache.with_stores(&mut |stores| {
            stores.remove_prefix(path);
        });
    }

    /// Drops the cache entry at exactly `path`.
    pub fn clear_store(&self, path: &Path) {
        self.cache.with_stores(&mut |stores| {
            stores.remove(path);
        });
    }

    fn create_store<Op: Operation>(&self, operation: Op) -> OperationStore<Op::State> {
        let mut context = self.default_context.clone();
        self.creator
            .prepare(<Op::State as OperationState>::KIND, &mut context);
        OperationStore::new(operation, context)
    }
}

impl fmt::Debug for OperationClient {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut count = 0;
        self.cache.with_stores(&mut |stores| count = stores.len());
        fmt.debug_struct("OperationClient")
            .field("stores", &count)
            .finish()
    }
}
