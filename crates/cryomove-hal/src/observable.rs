//! Single-writer, multi-reader observable values.
//!
//! An [`Observable`] is held by the component that owns a value (an actuator's
//! position, its referenced flags, …).  Everybody else gets an
//! [`ObservableView`], which can read the value and register observers but
//! cannot write it.
//!
//! Observers are invoked synchronously, in registration order, on the thread
//! that performed the write.  No internal lock is held while observers run, so
//! an observer may freely read other observables or write its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    observers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    fn snapshot_observers(&self) -> Vec<Callback<T>> {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }
}

/// Writable handle to an observed value.
///
/// Cloning an `Observable` hands out another *writer*; composites do this to
/// let their child-subscription callbacks update their own values.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Read-only handle sharing the same value.
    pub fn view(&self) -> ObservableView<T> {
        ObservableView {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the value and notify every observer.
    pub fn set(&self, value: T) {
        self.update(|v| *v = value);
    }

    /// Modify the value in place and notify every observer with the result.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let current = {
            let mut guard = self.inner.value.write().unwrap_or_else(|e| e.into_inner());
            f(&mut guard);
            guard.clone()
        };
        for cb in self.inner.snapshot_observers() {
            cb(&current);
        }
    }
}

/// Read-only handle to an [`Observable`].
pub struct ObservableView<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ObservableView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ObservableView<T> {
    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register `f` to be called after every write.
    ///
    /// The observer stays registered for as long as the returned
    /// [`Subscription`] is alive.
    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(f)));

        let weak = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .observers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    #[cfg(test)]
    fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Guard returned by [`ObservableView::subscribe`]; unregisters on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
