//! The paginated runtime: next/previous/all-pages orchestration on top of
//! the store.
//!
//! A paginated operation fetches pages one id at a time. Its store state
//! holds the ordered, id-deduplicated page collection plus cursors for the
//! next/previous ids derived from the boundary pages. Four disjoint
//! intents exist — initial, next, previous and all — and deduplication is
//! per intent; with no pages loaded, next and previous collapse into the
//! single initial-page intent.

use crate::context::{Context, ContextKey};
use crate::path::Path;
use crate::state::{
    OperationIntent, OperationKind, OperationState, ResultUpdateReasonKey, UpdateReason,
    UpdateStamps,
};
use crate::store::{
    DeduplicationKey, Operation, OperationContinuation, OperationStore, RunResult,
};
use crate::task::{OperationTask, TaskError, TaskHandle, TaskId};
use crate::time::ClockKey;
use crate::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{BuildHasherDefault, Hash};
use std::sync::Arc;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// One fetched page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<Id, V> {
    /// The page's identifier.
    pub id: Id,
    /// The page's value.
    pub value: V,
}

/// The ordered, id-deduplicated page collection.
///
/// Order is the discovery order: next pages append, previous pages
/// prepend, and a full refetch re-establishes the order from scratch.
/// Inserting a page whose id is already present replaces it in place.
#[derive(Clone)]
pub struct Pages<Id: Eq + Hash, V> {
    entries: FxIndexMap<Id, V>,
}

impl<Id: Clone + Eq + Hash, V: Clone> Pages<Id, V> {
    /// An empty collection.
    pub fn new() -> Self {
        Pages {
            entries: FxIndexMap::default(),
        }
    }

    /// The number of pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no page is loaded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The value of the page with `id`.
    pub fn get(&self, id: &Id) -> Option<&V> {
        self.entries.get(id)
    }

    /// The earliest page in discovery order.
    pub fn first(&self) -> Option<Page<Id, V>> {
        self.entries.first().map(|(id, value)| Page {
            id: id.clone(),
            value: value.clone(),
        })
    }

    /// The latest page in discovery order.
    pub fn last(&self) -> Option<Page<Id, V>> {
        self.entries.last().map(|(id, value)| Page {
            id: id.clone(),
            value: value.clone(),
        })
    }

    /// Iterates pages in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = Page<Id, V>> + '_ {
        self.entries.iter().map(|(id, value)| Page {
            id: id.clone(),
            value: value.clone(),
        })
    }

    /// The pages as a vector, in discovery order.
    pub fn to_vec(&self) -> Vec<Page<Id, V>> {
        self.iter().collect()
    }

    pub(crate) fn push_back(&mut self, page: Page<Id, V>) {
        self.entries.insert(page.id, page.value);
    }

    pub(crate) fn push_front(&mut self, page: Page<Id, V>) {
        if self.entries.contains_key(&page.id) {
            self.entries.insert(page.id, page.value);
        } else {
            self.entries.shift_insert(0, page.id, page.value);
        }
    }

    pub(crate) fn replace_all(&mut self, pages: Vec<Page<Id, V>>) {
        self.entries.clear();
        for page in pages {
            self.entries.insert(page.id, page.value);
        }
    }

    pub(crate) fn from_pages(pages: Vec<Page<Id, V>>) -> Self {
        let mut collection = Pages::new();
        collection.replace_all(pages);
        collection
    }
}

impl<Id: Clone + Eq + Hash, V: Clone> Default for Pages<Id, V> {
    fn default() -> Self {
        Pages::new()
    }
}

impl<Id: Eq + Hash + PartialEq, V: PartialEq> PartialEq for Pages<Id, V> {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a == b)
    }
}

impl<Id: fmt::Debug + Eq + Hash, V: fmt::Debug> fmt::Debug for Pages<Id, V> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_map().entries(self.entries.iter()).finish()
    }
}

/// The paginated intent space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PageIntent {
    /// Fetch the very first page (also the collapsed intent for next and
    /// previous while nothing is loaded).
    Initial,
    /// Fetch the page after the latest one.
    Next,
    /// Fetch the page before the earliest one.
    Previous,
    /// Refetch every loaded page in waterfall order.
    All,
}

impl OperationIntent for PageIntent {
    fn default_intent() -> Self {
        PageIntent::Initial
    }

    fn label(&self) -> &'static str {
        match self {
            PageIntent::Initial => "initial page",
            PageIntent::Next => "next page",
            PageIntent::Previous => "previous page",
            PageIntent::All => "all pages",
        }
    }
}

/// Context key telling a paginated operation body which intent it is
/// executing.
pub struct PageRequestKey;

impl ContextKey for PageRequestKey {
    type Value = PageIntent;

    fn default_value() -> PageIntent {
        PageIntent::Initial
    }

    fn name() -> &'static str {
        "PageRequest"
    }
}

/// What one executed page intent produces: the fetched pages plus updated
/// boundary cursors (`None` leaves a cursor untouched).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageFetchOutcome<Id, V> {
    /// The intent that produced this outcome.
    pub request: PageIntent,
    /// The pages fetched, in fetch order.
    pub pages: Vec<Page<Id, V>>,
    /// New next-page cursor, when this intent derives one.
    pub next_cursor: Option<Option<Id>>,
    /// New previous-page cursor, when this intent derives one.
    pub previous_cursor: Option<Option<Id>>,
}

/// Subscriber events specific to page fetches.
#[derive(Clone, Debug)]
pub enum PageEvent<Id, V, E> {
    /// A page fetch began.
    FetchingStarted {
        /// The page being fetched.
        page_id: Id,
    },
    /// A page fetch produced a result (yields included).
    ResultReceived {
        /// The page the result belongs to.
        page_id: Id,
        /// The fetched value or the failure.
        result: Result<V, E>,
    },
    /// A page fetch finished.
    FetchingEnded {
        /// The page that was being fetched.
        page_id: Id,
    },
}

/// State of a paginated operation.
#[derive(Clone)]
pub struct PaginatedState<Id: Clone + Eq + Hash, V: Clone, E> {
    pages: Pages<Id, V>,
    initial_page_id: Id,
    next_cursor: Option<Option<Id>>,
    previous_cursor: Option<Option<Id>>,
    error: Option<E>,
    stamps: UpdateStamps,
    active_initial: Vec<TaskHandle>,
    active_next: Vec<TaskHandle>,
    active_previous: Vec<TaskHandle>,
    active_all: Vec<TaskHandle>,
}

impl<Id, V, E> PaginatedState<Id, V, E>
where
    Id: Clone + Eq + Hash,
    V: Clone,
{
    /// A fresh state that will start paging from `initial_page_id`.
    pub fn new(initial_page_id: Id) -> Self {
        PaginatedState {
            pages: Pages::new(),
            initial_page_id,
            next_cursor: None,
            previous_cursor: None,
            error: None,
            stamps: UpdateStamps::default(),
            active_initial: Vec::new(),
            active_next: Vec::new(),
            active_previous: Vec::new(),
            active_all: Vec::new(),
        }
    }

    /// The loaded pages.
    pub fn pages(&self) -> &Pages<Id, V> {
        &self.pages
    }

    /// The id paging starts from.
    pub fn initial_page_id(&self) -> &Id {
        &self.initial_page_id
    }

    /// True until an attempt learns there is no page after the latest one.
    pub fn has_next_page(&self) -> bool {
        !matches!(self.next_cursor, Some(None))
    }

    /// True until an attempt learns there is no page before the earliest
    /// one.
    pub fn has_previous_page(&self) -> bool {
        !matches!(self.previous_cursor, Some(None))
    }

    pub(crate) fn next_cursor(&self) -> &Option<Option<Id>> {
        &self.next_cursor
    }

    pub(crate) fn previous_cursor(&self) -> &Option<Option<Id>> {
        &self.previous_cursor
    }

    fn intent_tasks(&self, intent: PageIntent) -> &Vec<TaskHandle> {
        match intent {
            PageIntent::Initial => &self.active_initial,
            PageIntent::Next => &self.active_next,
            PageIntent::Previous => &self.active_previous,
            PageIntent::All => &self.active_all,
        }
    }

    fn intent_tasks_mut(&mut self, intent: PageIntent) -> &mut Vec<TaskHandle> {
        match intent {
            PageIntent::Initial => &mut self.active_initial,
            PageIntent::Next => &mut self.active_next,
            PageIntent::Previous => &mut self.active_previous,
            PageIntent::All => &mut self.active_all,
        }
    }

    fn intent_in_flight(&self, intent: PageIntent) -> bool {
        self.intent_tasks(intent)
            .iter()
            .any(|task| !task.is_finished())
    }

    /// True while the initial-page intent is in flight and no page is
    /// loaded yet.
    pub fn is_loading_initial_page(&self) -> bool {
        self.intent_in_flight(PageIntent::Initial) && self.pages.is_empty()
    }

    /// True while a next-page fetch is in flight and at least one page is
    /// loaded.
    pub fn is_loading_next_page(&self) -> bool {
        self.intent_in_flight(PageIntent::Next) && !self.pages.is_empty()
    }

    /// True while a previous-page fetch is in flight and at least one page
    /// is loaded.
    pub fn is_loading_previous_page(&self) -> bool {
        self.intent_in_flight(PageIntent::Previous) && !self.pages.is_empty()
    }

    /// True while a full refetch is in flight.
    pub fn is_loading_all_pages(&self) -> bool {
        self.intent_in_flight(PageIntent::All)
    }
}

impl<Id, V, E> OperationState for PaginatedState<Id, V, E>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Value = Pages<Id, V>;
    type RunOutput = PageFetchOutcome<Id, V>;
    type Failure = E;
    type Intent = PageIntent;
    type Event = PageEvent<Id, V, E>;

    const KIND: OperationKind = OperationKind::Paginated;

    fn current_value(&self) -> Option<&Pages<Id, V>> {
        if self.stamps.value_update_count() > 0 {
            Some(&self.pages)
        } else {
            None
        }
    }

    fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    fn stamps(&self) -> &UpdateStamps {
        &self.stamps
    }

    fn update_from(&mut self, result: &Result<PageFetchOutcome<Id, V>, E>, context: &Context) {
        let now = context.get::<ClockKey>().now();
        match result {
            Ok(outcome) => {
                match outcome.request {
                    PageIntent::Initial | PageIntent::Next => {
                        for page in outcome.pages.iter().cloned() {
                            self.pages.push_back(page);
                        }
                    }
                    PageIntent::Previous => {
                        for page in outcome.pages.iter().cloned() {
                            self.pages.push_front(page);
                        }
                    }
                    PageIntent::All => {
                        self.pages.replace_all(outcome.pages.clone());
                    }
                }
                if let Some(cursor) = &outcome.next_cursor {
                    self.next_cursor = Some(cursor.clone());
                }
                if let Some(cursor) = &outcome.previous_cursor {
                    self.previous_cursor = Some(cursor.clone());
                }
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

    fn task_scheduled(&mut self, intent: &PageIntent, task: TaskHandle) {
        self.intent_tasks_mut(*intent).push(task);
    }

    fn task_settled(&mut self, intent: &PageIntent, task: TaskId) {
        self.intent_tasks_mut(*intent)
            .retain(|active| active.id() != task);
    }

    fn active_tasks(&self) -> Vec<TaskHandle> {
        self.active_initial
            .iter()
            .chain(&self.active_next)
            .chain(&self.active_previous)
            .chain(&self.active_all)
            .cloned()
            .collect()
    }
}

impl<Id, V, E> fmt::Debug for PaginatedState<Id, V, E>
where
    Id: Clone + Eq + Hash + fmt::Debug,
    V: Clone + fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PaginatedState")
            .field("pages", &self.pages)
            .field("initial_page_id", &self.initial_page_id)
            .field("next_cursor", &self.next_cursor)
            .field("previous_cursor", &self.previous_cursor)
            .field("error", &self.error)
            .field("stamps", &self.stamps)
            .finish()
    }
}

/// A descriptor for an operation that reads its result one page at a time.
pub trait PaginatedOperation: Send + Sync + 'static {
    /// The page identifier type.
    type PageId: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// The value one page holds.
    type PageValue: Clone + Send + Sync + 'static;
    /// The failure type of a page fetch.
    type Failure: Clone + Send + Sync + 'static;

    /// The operation's identity.
    fn path(&self) -> Path;

    /// The id paging starts from.
    fn initial_page_id(&self) -> Self::PageId;

    /// The id of the page after `page`, or `None` at the end.
    fn page_id_after(&self, page: &Page<Self::PageId, Self::PageValue>) -> Option<Self::PageId>;

    /// The id of the page before `page`, or `None` at the beginning.
    fn page_id_before(&self, page: &Page<Self::PageId, Self::PageValue>) -> Option<Self::PageId>;

    /// Fetches one page. Partial values may be streamed through
    /// `continuation`.
    fn fetch_page(
        self: Arc<Self>,
        id: Self::PageId,
        context: Context,
        continuation: PageContinuation<Self::PageId, Self::PageValue, Self::Failure>,
    ) -> BoxFuture<'static, Result<Self::PageValue, Self::Failure>>;

    /// Adjusts the context a store for this operation is created with.
    fn setup(&self, context: &mut Context) {
        let _ = context;
    }
}

type PaginatedStateOf<Op> = PaginatedState<
    <Op as PaginatedOperation>::PageId,
    <Op as PaginatedOperation>::PageValue,
    <Op as PaginatedOperation>::Failure,
>;

/// Streams partial values for one page while it is being fetched.
pub struct PageContinuation<
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
> {
    page_id: Id,
    request: PageIntent,
    continuation: OperationContinuation<PaginatedState<Id, V, E>>,
}

impl<Id, V, E> PageContinuation<Id, V, E>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Streams a partial value for the page being fetched. The page is
    /// recorded with the yielded-result reason and subscribers see a
    /// page-result event followed by a state change.
    pub fn yield_value(&self, value: V) {
        self.continuation.emit(PageEvent::ResultReceived {
            page_id: self.page_id.clone(),
            result: Ok(value.clone()),
        });
        self.continuation.yield_value(PageFetchOutcome {
            request: self.request,
            pages: vec![Page {
                id: self.page_id.clone(),
                value,
            }],
            next_cursor: None,
            previous_cursor: None,
        });
    }

    /// The context of the current attempt.
    pub fn context(&self) -> &Context {
        self.continuation.context()
    }
}

/// Lifts a [`PaginatedOperation`] into an [`Operation`] driving a
/// [`PaginatedState`].
pub struct Paginated<Op> {
    operation: Arc<Op>,
}

impl<Op: PaginatedOperation> Paginated<Op> {
    /// Wraps `operation`.
    pub fn new(operation: Op) -> Self {
        Paginated {
            operation: Arc::new(operation),
        }
    }
}

impl<Op: PaginatedOperation> Operation for Paginated<Op> {
    type State = PaginatedStateOf<Op>;

    fn path(&self) -> Path {
        self.operation.path()
    }

    fn initial_state(&self) -> Self::State {
        PaginatedState::new(self.operation.initial_page_id())
    }

    fn setup(&self, context: &mut Context) {
        self.operation.setup(context);
    }

    fn run(
        self: Arc<Self>,
        context: Context,
        continuation: OperationContinuation<Self::State>,
    ) -> BoxFuture<'static, RunResult<Self::State>> {
        let operation = self.operation.clone();
        async move {
            let request = context.get::<PageRequestKey>();
            match request {
                PageIntent::Initial => {
                    let id = operation.initial_page_id();
                    let page = fetch_one(&operation, request, id, &context, &continuation).await?;
                    let next_cursor = Some(operation.page_id_after(&page));
                    let previous_cursor = Some(operation.page_id_before(&page));
                    Ok(PageFetchOutcome {
                        request,
                        pages: vec![page],
                        next_cursor,
                        previous_cursor,
                    })
                }
                PageIntent::Next => {
                    let state = continuation.state();
                    let target = next_target(&operation, state.as_ref());
                    match target {
                        None => Ok(PageFetchOutcome {
                            request,
                            pages: Vec::new(),
                            next_cursor: Some(None),
                            previous_cursor: None,
                        }),
                        Some(id) => {
                            let page =
                                fetch_one(&operation, request, id, &context, &continuation).await?;
                            let next_cursor = Some(operation.page_id_after(&page));
                            Ok(PageFetchOutcome {
                                request,
                                pages: vec![page],
                                next_cursor,
                                previous_cursor: None,
                            })
                        }
                    }
                }
                PageIntent::Previous => {
                    let state = continuation.state();
                    let target = previous_target(&operation, state.as_ref());
                    match target {
                        None => Ok(PageFetchOutcome {
                            request,
                            pages: Vec::new(),
                            next_cursor: None,
                            previous_cursor: Some(None),
                        }),
                        Some(id) => {
                            let page =
                                fetch_one(&operation, request, id, &context, &continuation).await?;
                            let previous_cursor = Some(operation.page_id_before(&page));
                            Ok(PageFetchOutcome {
                                request,
                                pages: vec![page],
                                next_cursor: None,
                                previous_cursor,
                            })
                        }
                    }
                }
                PageIntent::All => {
                    let loaded = continuation
                        .state()
                        .map(|state| state.pages().clone())
                        .unwrap_or_default();
                    if loaded.is_empty() {
                        // Nothing loaded: refetching everything is a no-op
                        // that succeeds with an empty collection.
                        return Ok(PageFetchOutcome {
                            request,
                            pages: Vec::new(),
                            next_cursor: None,
                            previous_cursor: None,
                        });
                    }
                    let limit = loaded.len();
                    let mut refetched: Vec<Page<Op::PageId, Op::PageValue>> = Vec::new();
                    let mut target = loaded.first().map(|page| page.id);
                    while let Some(id) = target {
                        // A failed page aborts the waterfall and the
                        // failure is the intent's outcome.
                        let page =
                            fetch_one(&operation, request, id, &context, &continuation).await?;
                        refetched.push(page);
                        if refetched.len() >= limit {
                            break;
                        }
                        target = operation.page_id_after(
                            refetched.last().expect("a page was just refetched"),
                        );
                    }
                    let next_cursor = Some(
                        refetched
                            .last()
                            .and_then(|page| operation.page_id_after(page)),
                    );
                    let previous_cursor = Some(
                        refetched
                            .first()
                            .and_then(|page| operation.page_id_before(page)),
                    );
                    Ok(PageFetchOutcome {
                        request,
                        pages: refetched,
                        next_cursor,
                        previous_cursor,
                    })
                }
            }
        }
        .boxed()
    }
}

fn next_target<Op: PaginatedOperation>(
    operation: &Arc<Op>,
    state: Option<&PaginatedStateOf<Op>>,
) -> Option<Op::PageId> {
    let state = match state {
        Some(state) if !state.pages().is_empty() => state,
        // No pages loaded (or no store): next collapses to the initial id.
        _ => return Some(operation.initial_page_id()),
    };
    match state.next_cursor() {
        Some(cursor) => cursor.clone(),
        None => state
            .pages()
            .last()
            .and_then(|page| operation.page_id_after(&page)),
    }
}

fn previous_target<Op: PaginatedOperation>(
    operation: &Arc<Op>,
    state: Option<&PaginatedStateOf<Op>>,
) -> Option<Op::PageId> {
    let state = match state {
        Some(state) if !state.pages().is_empty() => state,
        _ => return Some(operation.initial_page_id()),
    };
    match state.previous_cursor() {
        Some(cursor) => cursor.clone(),
        None => state
            .pages()
            .first()
            .and_then(|page| operation.page_id_before(&page)),
    }
}

/// Fetches one page, bracketing it with page events.
async fn fetch_one<Op: PaginatedOperation>(
    operation: &Arc<Op>,
    request: PageIntent,
    id: Op::PageId,
    context: &Context,
    continuation: &OperationContinuation<PaginatedStateOf<Op>>,
) -> Result<Page<Op::PageId, Op::PageValue>, Op::Failure> {
    continuation.emit(PageEvent::FetchingStarted {
        page_id: id.clone(),
    });
    let page_continuation = PageContinuation {
        page_id: id.clone(),
        request,
        continuation: continuation.clone(),
    };
    let result = operation
        .clone()
        .fetch_page(id.clone(), context.clone(), page_continuation)
        .await;
    continuation.emit(PageEvent::ResultReceived {
        page_id: id.clone(),
        result: result.clone(),
    });
    continuation.emit(PageEvent::FetchingEnded {
        page_id: id.clone(),
    });
    result.map(|value| Page { id, value })
}

impl<Id, V, E> crate::store::EventHandler<PaginatedState<Id, V, E>>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Invoked when a page fetch begins.
    pub fn on_page_fetching_started(
        self,
        f: impl Fn(&Id, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.on_operation_event(move |event, context| {
            if let PageEvent::FetchingStarted { page_id } = event {
                f(page_id, context);
            }
        })
    }

    /// Invoked for every page result, yields included.
    pub fn on_page_result_received(
        self,
        f: impl Fn(&Id, &Result<V, E>, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.on_operation_event(move |event, context| {
            if let PageEvent::ResultReceived { page_id, result } = event {
                f(page_id, result, context);
            }
        })
    }

    /// Invoked when a page fetch finishes.
    pub fn on_page_fetching_ended(
        self,
        f: impl Fn(&Id, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.on_operation_event(move |event, context| {
            if let PageEvent::FetchingEnded { page_id } = event {
                f(page_id, context);
            }
        })
    }
}

impl<Id, V, E> OperationStore<PaginatedState<Id, V, E>>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Fetches the page after the latest loaded one (the initial page when
    /// nothing is loaded). Returns `Ok(None)` when a previous attempt
    /// established there is no next page.
    pub async fn fetch_next_page(&self) -> Result<Option<Page<Id, V>>, TaskError<E>> {
        match self.next_page_task() {
            None => Ok(None),
            Some(task) => {
                let outcome = task.run_if_needed().await?;
                Ok(outcome.pages.into_iter().last())
            }
        }
    }

    /// Like [`fetch_next_page`](Self::fetch_next_page), but returns the
    /// task without awaiting it. `None` when there is no next page.
    pub fn next_page_task(
        &self,
    ) -> Option<OperationTask<PageFetchOutcome<Id, V>, E>> {
        let task = self.with_inner(|inner| {
            let intent = if inner.state.pages().is_empty() {
                PageIntent::Initial
            } else if !inner.state.has_next_page() {
                return None;
            } else {
                PageIntent::Next
            };
            Some(self.page_intent_task_locked(inner, intent))
        });
        self.drain();
        task
    }

    /// Fetches the page before the earliest loaded one (the initial page
    /// when nothing is loaded). Returns `Ok(None)` when a previous attempt
    /// established there is no previous page.
    pub async fn fetch_previous_page(&self) -> Result<Option<Page<Id, V>>, TaskError<E>> {
        match self.previous_page_task() {
            None => Ok(None),
            Some(task) => {
                let outcome = task.run_if_needed().await?;
                Ok(outcome.pages.into_iter().last())
            }
        }
    }

    /// Like [`fetch_previous_page`](Self::fetch_previous_page), but
    /// returns the task without awaiting it.
    pub fn previous_page_task(
        &self,
    ) -> Option<OperationTask<PageFetchOutcome<Id, V>, E>> {
        let task = self.with_inner(|inner| {
            let intent = if inner.state.pages().is_empty() {
                PageIntent::Initial
            } else if !inner.state.has_previous_page() {
                return None;
            } else {
                PageIntent::Previous
            };
            Some(self.page_intent_task_locked(inner, intent))
        });
        self.drain();
        task
    }

    /// Refetches every loaded page in waterfall order, starting from the
    /// earliest. A failed page aborts the refetch with that failure; with
    /// nothing loaded this is a successful no-op.
    pub async fn refetch_all_pages(&self) -> Result<Pages<Id, V>, TaskError<E>> {
        let outcome = self.all_pages_task().run_if_needed().await?;
        Ok(Pages::from_pages(outcome.pages))
    }

    /// Like [`refetch_all_pages`](Self::refetch_all_pages), but returns
    /// the task without awaiting it.
    pub fn all_pages_task(&self) -> OperationTask<PageFetchOutcome<Id, V>, E> {
        let task = self.with_inner(|inner| self.page_intent_task_locked(inner, PageIntent::All));
        self.drain();
        task
    }

    fn page_intent_task_locked(
        &self,
        inner: &mut crate::store::StoreInner<PaginatedState<Id, V, E>>,
        intent: PageIntent,
    ) -> OperationTask<PageFetchOutcome<Id, V>, E> {
        if inner.context.get::<DeduplicationKey>() {
            if let Some(existing) = inner.tasks.get(&intent) {
                if !existing.is_finished() {
                    return existing.clone();
                }
            }
        }

        let mut context = inner.context.clone();
        context.insert::<PageRequestKey>(intent);

        // `all` joins the page intents already in flight; page intents
        // issued while an `all` is in flight wait for it and then operate
        // on the refetched pages.
        let predecessors: Vec<_> = match intent {
            PageIntent::All => [PageIntent::Initial, PageIntent::Next, PageIntent::Previous]
                .iter()
                .filter_map(|other| inner.tasks.get(other))
                .filter(|task| !task.is_finished())
                .cloned()
                .collect(),
            _ => inner
                .tasks
                .get(&PageIntent::All)
                .filter(|task| !task.is_finished())
                .cloned()
                .into_iter()
                .collect(),
        };

        let task = self.spawn_intent_locked(inner, intent, Some(context), true);
        for predecessor in predecessors {
            task.schedule_after(&predecessor);
        }
        task
    }
}
