//! Capabilities the runtime consumes from its environment.
//!
//! None of these are implemented against a real platform here; the crate
//! only defines the contracts and reads implementations out of the
//! [`Context`](crate::Context). Production adapters (an HTTP stack, a
//! reachability probe, a notification center bridge) are expected to be
//! thin wrappers over these traits.

use crate::context::ContextKey;
use crate::path::Path;
use crate::subscription::Subscription;
use crate::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// An opaque supplier of response bytes for a request. The runtime never
/// parses HTTP itself.
pub trait HttpTransport: Send + Sync + 'static {
    /// Performs `request` and resolves with the raw body bytes and the
    /// response metadata.
    fn data(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<(Vec<u8>, HttpResponseMetadata), std::io::Error>>;
}

/// A transport request.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// Target URL.
    pub url: String,
    /// Request method, e.g. `"GET"`.
    pub method: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

/// Metadata accompanying a transport response.
#[derive(Clone, Debug)]
pub struct HttpResponseMetadata {
    /// Response status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
}

/// A memory-pressure level reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPressure {
    /// No pressure; nothing should be evicted.
    Normal,
    /// The platform asked applications to shed reclaimable memory.
    Warning,
    /// The platform is about to take action against the process.
    Critical,
}

/// The set of [`MemoryPressure`] levels under which a store may be evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MemoryPressureSet {
    warning: bool,
    critical: bool,
}

impl MemoryPressureSet {
    /// No level evicts.
    pub const fn empty() -> Self {
        MemoryPressureSet {
            warning: false,
            critical: false,
        }
    }

    /// Evict under both warning and critical pressure.
    pub const fn all() -> Self {
        MemoryPressureSet {
            warning: true,
            critical: true,
        }
    }

    /// Evict only under critical pressure.
    pub const fn critical_only() -> Self {
        MemoryPressureSet {
            warning: false,
            critical: true,
        }
    }

    /// Adds `level` to the set. `Normal` never evicts and is ignored.
    pub fn with(mut self, level: MemoryPressure) -> Self {
        match level {
            MemoryPressure::Normal => {}
            MemoryPressure::Warning => self.warning = true,
            MemoryPressure::Critical => self.critical = true,
        }
        self
    }

    /// True when `level` is in the set.
    pub fn contains(&self, level: MemoryPressure) -> bool {
        match level {
            MemoryPressure::Normal => false,
            MemoryPressure::Warning => self.warning,
            MemoryPressure::Critical => self.critical,
        }
    }
}

/// A source of memory-pressure signals.
pub trait MemoryPressureSource: Send + Sync + 'static {
    /// Registers `on_pressure` to be invoked for every signal until the
    /// returned subscription is cancelled.
    fn subscribe(&self, on_pressure: Box<dyn Fn(MemoryPressure) + Send + Sync>) -> Subscription;
}

/// A posted notification.
#[derive(Clone, Debug)]
pub struct Notification {
    /// The notification name it was posted under.
    pub name: Arc<str>,
}

/// A named-notification bus (e.g. a notification-center bridge).
pub trait NotificationSource: Send + Sync + 'static {
    /// Registers `on_post` for notifications posted under `name`.
    fn subscribe(
        &self,
        name: &str,
        on_post: Box<dyn Fn(&Notification) + Send + Sync>,
    ) -> Subscription;
}

/// Network connectivity as reported by a reachability probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    /// The network is reachable.
    Connected,
    /// The network is unreachable.
    Disconnected,
    /// Reachable only after a connection is established (e.g. VPN dial-up).
    RequiresConnection,
}

/// An observer of network connectivity.
pub trait NetworkStatusObserver: Send + Sync + 'static {
    /// The most recently observed status.
    fn current_status(&self) -> NetworkStatus;

    /// Registers `on_change` for status transitions.
    fn subscribe(&self, on_change: Box<dyn Fn(NetworkStatus) + Send + Sync>) -> Subscription;
}

/// A user-facing message emitted by the alerts modifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertMessage {
    /// The message text.
    pub message: Arc<str>,
}

impl AlertMessage {
    /// Builds a message from anything string-like.
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        AlertMessage {
            message: message.into(),
        }
    }
}

/// A sink for [`AlertMessage`]s, typically bridged to the application's
/// presentation layer.
pub trait AlertSink: Send + Sync + 'static {
    /// Delivers `message`.
    fn post(&self, message: AlertMessage);
}

/// A non-fatal programmer-error diagnostic.
#[derive(Clone, Debug)]
pub enum Diagnostic {
    /// Two different operation types were registered under one path.
    DuplicatePath {
        /// The contested path.
        path: Path,
        /// Type name of the operation already registered.
        existing: &'static str,
        /// Type name of the operation the caller supplied.
        requested: &'static str,
    },
    /// A task was cancelled before it ever began running.
    CancelledBeforeStart {
        /// The task's human-readable name.
        task: Arc<str>,
    },
    /// `retry_latest` was invoked on a mutation store with no history.
    RetryLatestWithoutHistory {
        /// The mutation's path.
        path: Path,
    },
    /// A run-specification change stream reported an error.
    RunSpecificationFailure {
        /// The specification's label.
        label: &'static str,
        /// A description of what went wrong.
        message: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DuplicatePath {
                path,
                existing,
                requested,
            } => write!(
                fmt,
                "duplicate path {path:?} used for different operation types: \
                 {existing} is registered, {requested} was requested; returning a detached store"
            ),
            Diagnostic::CancelledBeforeStart { task } => {
                write!(fmt, "task {task:?} was cancelled before it began running")
            }
            Diagnostic::RetryLatestWithoutHistory { path } => write!(
                fmt,
                "retry_latest invoked on mutation {path:?} with no prior mutate call"
            ),
            Diagnostic::RunSpecificationFailure { label, message } => {
                write!(fmt, "run specification {label:?} change stream failed: {message}")
            }
        }
    }
}

/// The single injectable reporter all warnings funnel through.
pub trait DiagnosticReporter: Send + Sync + fmt::Debug + 'static {
    /// Reports one diagnostic.
    fn report(&self, diagnostic: &Diagnostic);
}

/// The default [`DiagnosticReporter`]: forwards to `log::warn!`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl DiagnosticReporter for LogReporter {
    fn report(&self, diagnostic: &Diagnostic) {
        log::warn!("{diagnostic}");
    }
}

/// Context key for the injectable [`DiagnosticReporter`].
pub struct DiagnosticReporterKey;

impl ContextKey for DiagnosticReporterKey {
    type Value = Arc<dyn DiagnosticReporter>;

    fn default_value() -> Self::Value {
        Arc::new(LogReporter)
    }

    fn name() -> &'static str {
        "DiagnosticReporter"
    }
}

// The capability keys below all default to "absent": the runtime only uses
// a capability when the application installed one.

/// Context key for the [`AlertSink`] the alerts modifier posts to.
pub struct AlertSinkKey;

impl ContextKey for AlertSinkKey {
    type Value = Option<DynAlertSink>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "AlertSink"
    }
}

/// Context key for the [`NotificationSource`] notification-backed run
/// specifications subscribe to.
pub struct NotificationSourceKey;

impl ContextKey for NotificationSourceKey {
    type Value = Option<DynNotificationSource>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "NotificationSource"
    }
}

/// Context key for the [`NetworkStatusObserver`] behind the
/// connected-only run specification.
pub struct NetworkObserverKey;

impl ContextKey for NetworkObserverKey {
    type Value = Option<DynNetworkObserver>;

    fn default_value() -> Self::Value {
        None
    }

    fn name() -> &'static str {
        "NetworkObserver"
    }
}

/// Context key for the set of pressure levels that may evict the store.
pub struct EvictableMemoryPressureKey;

impl ContextKey for EvictableMemoryPressureKey {
    type Value = MemoryPressureSet;

    fn default_value() -> MemoryPressureSet {
        MemoryPressureSet::all()
    }

    fn name() -> &'static str {
        "EvictableMemoryPressure"
    }
}

macro_rules! debug_handle {
    ($(#[$doc:meta] $name:ident($trait_:ident));* $(;)?) => {
        $(
            #[$doc]
            #[derive(Clone)]
            pub struct $name(
                /// The wrapped implementation.
                pub Arc<dyn $trait_>,
            );

            impl fmt::Debug for $name {
                fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(fmt, concat!("<", stringify!($trait_), ">"))
                }
            }

            impl std::ops::Deref for $name {
                type Target = dyn $trait_;

                fn deref(&self) -> &Self::Target {
                    &*self.0
                }
            }
        )*
    };
}

debug_handle! {
    /// A shareable, context-storable [`AlertSink`] handle.
    DynAlertSink(AlertSink);
    /// A shareable, context-storable [`NotificationSource`] handle.
    DynNotificationSource(NotificationSource);
    /// A shareable, context-storable [`NetworkStatusObserver`] handle.
    DynNetworkObserver(NetworkStatusObserver);
}
