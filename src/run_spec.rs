//! Predicates that decide when a store should automatically re-run.
//!
//! A [`RunSpecification`] is a predicate over the store's context plus a
//! change stream. The store observes its specifications; whenever a change
//! fires while the combined predicate is satisfied, the store schedules a
//! re-run of its operation.

use crate::context::{Context, ContextKey};
use crate::sources::{NetworkObserverKey, NetworkStatus, NotificationSourceKey};
use crate::subscription::Subscription;
use std::fmt;
use std::sync::Arc;

/// Invoked by a specification whenever its satisfaction may have changed.
pub type OnSpecificationChange = Arc<dyn Fn() + Send + Sync>;

/// A predicate + change stream controlling automatic re-runs.
pub trait RunSpecification: Send + Sync + 'static {
    /// Whether a run is currently allowed/desired.
    fn is_satisfied(&self, context: &Context) -> bool;

    /// Registers interest in satisfaction changes. Implementations that
    /// never change may return [`Subscription::empty`].
    fn subscribe(&self, context: &Context, on_change: OnSpecificationChange) -> Subscription;

    /// A short label used in diagnostics and for targeted removal by
    /// modifiers such as `completely_offline`.
    fn label(&self) -> &'static str {
        "custom"
    }
}

/// A specification with a constant answer.
struct Always(bool);

impl RunSpecification for Always {
    fn is_satisfied(&self, _context: &Context) -> bool {
        self.0
    }

    fn subscribe(&self, _context: &Context, _on_change: OnSpecificationChange) -> Subscription {
        Subscription::empty()
    }

    fn label(&self) -> &'static str {
        "always"
    }
}

/// A specification that is constantly satisfied (`true`) or constantly
/// unsatisfiable (`false`).
pub fn always(value: bool) -> Arc<dyn RunSpecification> {
    Arc::new(Always(value))
}

struct AnyOf(Vec<Arc<dyn RunSpecification>>);

impl RunSpecification for AnyOf {
    fn is_satisfied(&self, context: &Context) -> bool {
        self.0.iter().any(|spec| spec.is_satisfied(context))
    }

    fn subscribe(&self, context: &Context, on_change: OnSpecificationChange) -> Subscription {
        Subscription::combined(
            self.0
                .iter()
                .map(|spec| spec.subscribe(context, on_change.clone())),
        )
    }

    fn label(&self) -> &'static str {
        "any"
    }
}

/// Satisfied when at least one of `specs` is satisfied. With no specs the
/// result is never satisfied.
pub fn any(specs: impl IntoIterator<Item = Arc<dyn RunSpecification>>) -> Arc<dyn RunSpecification> {
    Arc::new(AnyOf(specs.into_iter().collect()))
}

struct AllOf(Vec<Arc<dyn RunSpecification>>);

impl RunSpecification for AllOf {
    fn is_satisfied(&self, context: &Context) -> bool {
        self.0.iter().all(|spec| spec.is_satisfied(context))
    }

    fn subscribe(&self, context: &Context, on_change: OnSpecificationChange) -> Subscription {
        Subscription::combined(
            self.0
                .iter()
                .map(|spec| spec.subscribe(context, on_change.clone())),
        )
    }

    fn label(&self) -> &'static str {
        "all"
    }
}

/// Satisfied when every one of `specs` is satisfied. With no specs the
/// result is always satisfied.
pub fn all(specs: impl IntoIterator<Item = Arc<dyn RunSpecification>>) -> Arc<dyn RunSpecification> {
    Arc::new(AllOf(specs.into_iter().collect()))
}

/// Label of the built-in connectivity specification.
pub const NETWORK_CONNECTED_LABEL: &str = "network-connected";

/// Label of the built-in application-active specification.
pub const APPLICATION_ACTIVE_LABEL: &str = "application-active";

/// Notification name observed by the application-active specification.
pub const APPLICATION_ACTIVE_NOTIFICATION: &str = "chutney.application-did-become-active";

/// Satisfied while the context's network observer reports connectivity;
/// fires on every status change. Trivially satisfied when no observer is
/// installed.
pub struct NetworkConnectedSpecification;

impl RunSpecification for NetworkConnectedSpecification {
    fn is_satisfied(&self, context: &Context) -> bool {
        match context.get::<NetworkObserverKey>() {
            Some(observer) => observer.current_status() == NetworkStatus::Connected,
            None => true,
        }
    }

    fn subscribe(&self, context: &Context, on_change: OnSpecificationChange) -> Subscription {
        match context.get::<NetworkObserverKey>() {
            Some(observer) => observer.subscribe(Box::new(move |_status| on_change())),
            None => Subscription::empty(),
        }
    }

    fn label(&self) -> &'static str {
        NETWORK_CONNECTED_LABEL
    }
}

/// A specification backed by a named notification: always satisfied, and
/// signals a change whenever the notification is posted.
pub struct NotificationSpecification {
    name: Arc<str>,
    label: &'static str,
}

impl NotificationSpecification {
    /// Observes `name` on the context's notification source.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        NotificationSpecification {
            name: name.into(),
            label: "notification",
        }
    }

    /// The built-in application-active specification.
    pub fn application_active() -> Self {
        NotificationSpecification {
            name: APPLICATION_ACTIVE_NOTIFICATION.into(),
            label: APPLICATION_ACTIVE_LABEL,
        }
    }
}

impl RunSpecification for NotificationSpecification {
    fn is_satisfied(&self, _context: &Context) -> bool {
        true
    }

    fn subscribe(&self, context: &Context, on_change: OnSpecificationChange) -> Subscription {
        match context.get::<NotificationSourceKey>() {
            Some(source) => source.subscribe(&self.name, Box::new(move |_note| on_change())),
            None => Subscription::empty(),
        }
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

/// The ordered list of run specifications installed on a store's context.
#[derive(Clone, Default)]
pub struct RunSpecifications(Vec<Arc<dyn RunSpecification>>);

impl RunSpecifications {
    /// Appends a specification.
    pub fn push(&mut self, spec: Arc<dyn RunSpecification>) {
        self.0.push(spec);
    }

    /// Removes every specification carrying `label`.
    pub fn remove_label(&mut self, label: &str) {
        self.0.retain(|spec| spec.label() != label);
    }

    /// Replaces the whole list.
    pub fn replace(&mut self, specs: Vec<Arc<dyn RunSpecification>>) {
        self.0 = specs;
    }

    /// The conjunction of every installed specification.
    pub fn combined(&self) -> Arc<dyn RunSpecification> {
        all(self.0.iter().cloned())
    }

    /// True when no specification is installed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RunSpecifications {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_list()
            .entries(self.0.iter().map(|spec| spec.label()))
            .finish()
    }
}

/// Context key for the store's run specifications.
pub struct RunSpecificationsKey;

impl ContextKey for RunSpecificationsKey {
    type Value = RunSpecifications;

    fn default_value() -> RunSpecifications {
        RunSpecifications::default()
    }

    fn name() -> &'static str {
        "RunSpecifications"
    }
}

/// Context key deciding whether the store runs automatically on subscriber
/// attach and on specification changes.
pub struct AutomaticRunningKey;

impl ContextKey for AutomaticRunningKey {
    type Value = bool;

    fn default_value() -> bool {
        true
    }

    fn name() -> &'static str {
        "AutomaticRunning"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        satisfied: bool,
        subscribes: Arc<AtomicUsize>,
    }

    impl RunSpecification for Counting {
        fn is_satisfied(&self, _context: &Context) -> bool {
            self.satisfied
        }

        fn subscribe(&self, _context: &Context, _on_change: OnSpecificationChange) -> Subscription {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Subscription::empty()
        }
    }

    fn counting(satisfied: bool, subscribes: &Arc<AtomicUsize>) -> Arc<dyn RunSpecification> {
        Arc::new(Counting {
            satisfied,
            subscribes: subscribes.clone(),
        })
    }

    #[test]
    fn combinator_truth_tables() {
        let context = Context::new();
        let count = Arc::new(AtomicUsize::new(0));
        let t = counting(true, &count);
        let f = counting(false, &count);

        assert!(always(true).is_satisfied(&context));
        assert!(!always(false).is_satisfied(&context));
        assert!(any([t.clone(), f.clone()]).is_satisfied(&context));
        assert!(!any([f.clone()]).is_satisfied(&context));
        assert!(!any([]).is_satisfied(&context));
        assert!(all([t.clone(), t.clone()]).is_satisfied(&context));
        assert!(!all([t.clone(), f.clone()]).is_satisfied(&context));
        assert!(all([]).is_satisfied(&context));
    }

    #[test]
    fn combinators_subscribe_every_child() {
        let context = Context::new();
        let count = Arc::new(AtomicUsize::new(0));
        let spec = all([counting(true, &count), counting(false, &count)]);
        let subscription = spec.subscribe(&context, Arc::new(|| {}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        subscription.cancel();
    }

    #[test]
    fn specification_list_removal_by_label() {
        let mut specs = RunSpecifications::default();
        specs.push(Arc::new(NetworkConnectedSpecification));
        specs.push(Arc::new(NotificationSpecification::application_active()));
        specs.remove_label(NETWORK_CONNECTED_LABEL);
        assert_eq!(format!("{specs:?}"), "[\"application-active\"]");
    }

    #[test]
    fn network_specification_defaults_to_satisfied() {
        let context = Context::new();
        assert!(NetworkConnectedSpecification.is_satisfied(&context));
    }
}
