//! Per-instance callback registries used for status observation.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Set of callbacks notified with a value of type `T`.
pub(crate) struct Listeners<T> {
    next_id: AtomicU64,
    callbacks: DashMap<u64, Callback<T>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: DashMap::new(),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn register<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(id, Arc::new(callback));

        let registry: Weak<dyn Unregister> = Arc::downgrade(self) as Weak<dyn Unregister>;
        ListenerHandle { registry, id }
    }

    /// Invoke every registered callback. A panicking callback is logged and skipped.
    pub(crate) fn notify(&self, value: &T) {
        // Snapshot first so callbacks may register or unregister listeners.
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    panic = panic_message(panic.as_ref()),
                    "Status listener panicked"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &panic;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }
}

trait Unregister: Send + Sync {
    fn unregister(&self, id: u64) -> bool;
}

impl<T: 'static> Unregister for Listeners<T> {
    fn unregister(&self, id: u64) -> bool {
        self.callbacks.remove(&id).is_some()
    }
}

/// Handle returned when registering a listener; call [`ListenerHandle::unsubscribe`]
/// to stop receiving notifications.
///
/// Dropping the handle leaves the listener registered.
pub struct ListenerHandle {
    registry: Weak<dyn Unregister>,
    id: u64,
}

impl ListenerHandle {
    /// Remove the listener. Returns `false` if it was already removed or the
    /// owning connection manager is gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.unregister(self.id))
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
