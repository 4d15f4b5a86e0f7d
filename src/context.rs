//! The per-operation environment.
//!
//! A [`Context`] maps *key types* to values. Each key declares its value
//! type and a compile-time default, so reads never fail: asking for an
//! unset key yields the default. Contexts are snapshotted into every store
//! and every task, which is why the storage is copy-on-write — cloning a
//! context is an `Arc` bump until somebody writes to the copy.

use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A key into a [`Context`].
///
/// Implementors are usually empty marker types:
///
/// ```
/// use chutney::{Context, ContextKey};
///
/// struct TraceTag;
/// impl ContextKey for TraceTag {
///     type Value = Option<String>;
///     fn default_value() -> Self::Value {
///         None
///     }
/// }
///
/// let context = Context::new();
/// assert_eq!(context.get::<TraceTag>(), None);
/// ```
pub trait ContextKey: 'static {
    /// The type of value stored under this key.
    type Value: Clone + Send + Sync + fmt::Debug + 'static;

    /// The value observed when the key has never been set.
    fn default_value() -> Self::Value;

    /// The name used for this key in diagnostic output.
    fn name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

#[derive(Clone)]
struct ContextSlot {
    value: Arc<dyn Any + Send + Sync>,
    name: &'static str,
    // Renders the type-erased value for `Context`'s Debug output.
    fmt: fn(&(dyn Any + Send + Sync)) -> String,
}

/// A heterogeneous, type-keyed, copy-on-write environment.
#[derive(Clone, Default)]
pub struct Context {
    slots: Arc<FxHashMap<TypeId, ContextSlot>>,
}

impl Context {
    /// An empty context: every key reads as its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the value for `K`, falling back to `K::default_value()` when
    /// the key has never been set.
    pub fn get<K: ContextKey>(&self) -> K::Value {
        match self.slots.get(&TypeId::of::<K>()) {
            Some(slot) => slot
                .value
                .downcast_ref::<K::Value>()
                .expect("context slot stored under the wrong key type")
                .clone(),
            None => K::default_value(),
        }
    }

    /// Sets the value for `K`, copying the underlying storage if this
    /// context currently shares it with another.
    pub fn insert<K: ContextKey>(&mut self, value: K::Value) {
        fn render<V: fmt::Debug + 'static>(value: &(dyn Any + Send + Sync)) -> String {
            match value.downcast_ref::<V>() {
                Some(value) => format!("{value:?}"),
                None => "<unrenderable>".to_owned(),
            }
        }

        Arc::make_mut(&mut self.slots).insert(
            TypeId::of::<K>(),
            ContextSlot {
                value: Arc::new(value),
                name: K::name(),
                fmt: render::<K::Value>,
            },
        );
    }

    /// Removes the value for `K`, so reads observe the default again.
    pub fn remove<K: ContextKey>(&mut self) {
        if self.slots.contains_key(&TypeId::of::<K>()) {
            Arc::make_mut(&mut self.slots).remove(&TypeId::of::<K>());
        }
    }

    /// True when `K` has been explicitly set on this context.
    pub fn contains<K: ContextKey>(&self) -> bool {
        self.slots.contains_key(&TypeId::of::<K>())
    }

    /// Applies `edit` to the value for `K` and writes the result back.
    pub fn update<K: ContextKey>(&mut self, edit: impl FnOnce(&mut K::Value)) {
        let mut value = self.get::<K>();
        edit(&mut value);
        self.insert::<K>(value);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut slots: Vec<_> = self.slots.values().collect();
        slots.sort_by_key(|slot| slot.name);
        write!(fmt, "Context(")?;
        for (i, slot) in slots.iter().enumerate() {
            if i > 0 {
                write!(fmt, ", ")?;
            }
            write!(fmt, "{} = {}", slot.name, (slot.fmt)(&*slot.value))?;
        }
        write!(fmt, ")")
    }
}
