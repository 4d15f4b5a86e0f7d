//! Cancellable attachments to stores and external event sources.

use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A cancellable handle to some ongoing attachment (a store subscriber, a
/// run-specification observer, a notification registration, ...).
///
/// Cancellation is idempotent, and dropping the last handle of an
/// un-cancelled subscription cancels it. Equality is identity: two handles
/// are equal exactly when they refer to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// A subscription that invokes `on_cancel` the first time it is
    /// cancelled or dropped.
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Subscription {
            inner: Arc::new(SubscriptionInner {
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// One subscription whose cancellation cancels every child in order.
    pub fn combined(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let children: Vec<Subscription> = subscriptions.into_iter().collect();
        Subscription::new(move || {
            for child in &children {
                child.cancel();
            }
        })
    }

    /// Cancels the subscription. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        let on_cancel = self.inner.on_cancel.lock().take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    /// True once `cancel` has run (or there was never anything to cancel).
    pub fn is_cancelled(&self) -> bool {
        self.inner.on_cancel.lock().is_none()
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.get_mut().take() {
            on_cancel();
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscription {}

impl Hash for Subscription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let calls = calls.clone();
            Subscription::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(!subscription.is_cancelled());
        subscription.cancel();
        subscription.cancel();
        assert!(subscription.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_last_handle_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls_for_closure = calls.clone();
            let subscription = Subscription::new(move || {
                calls_for_closure.fetch_add(1, Ordering::SeqCst);
            });
            let second = subscription.clone();
            drop(subscription);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            drop(second);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn combined_cancels_children_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let child = |tag: &'static str| {
            let order = order.clone();
            Subscription::new(move || order.lock().push(tag))
        };

        let combined = Subscription::combined([child("a"), child("b"), child("c")]);
        combined.cancel();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn equality_is_identity() {
        let a = Subscription::empty();
        let b = a.clone();
        let c = Subscription::empty();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
