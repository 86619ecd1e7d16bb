//! Observer registration lists
//!
//! A [`Signal`] keeps its observers in registration order and calls them
//! synchronously on the emitting thread. Connecting returns a [`Connection`]
//! guard; dropping the guard unregisters the observer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    observers: Mutex<Vec<(u64, Observer<T>)>>,
    next_id: AtomicU64,
}

/// Synchronous fan-out to registered observers
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an observer. It stays connected while the returned guard lives.
    #[must_use = "the observer is disconnected when the Connection is dropped"]
    pub fn connect<F>(&self, observer: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, Arc::new(observer)));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Connection {
            disconnect: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.observers.lock().retain(|(oid, _)| *oid != id);
                }
            })),
        }
    }

    /// Call every observer with `value`, in registration order.
    ///
    /// Observers are snapshotted first so they may connect or disconnect
    /// without deadlocking the signal.
    pub fn emit(&self, value: &T) {
        let observers: Vec<Observer<T>> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        for observer in observers {
            observer(value);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration guard returned by [`Signal::connect`]
pub struct Connection {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Connection {
    /// Unregister now instead of on drop
    pub fn disconnect(mut self) {
        if let Some(f) = self.disconnect.take() {
            f();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(f) = self.disconnect.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_observers_called_in_registration_order() {
        let signal = Signal::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = log.clone();
        let _c1 = signal.connect(move |v| l1.lock().push(("first", *v)));
        let l2 = log.clone();
        let _c2 = signal.connect(move |v| l2.lock().push(("second", *v)));

        signal.emit(&7);

        assert_eq!(*log.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_drop_disconnects() {
        let signal = Signal::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let conn = signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&());
        drop(conn);
        signal.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.observer_count(), 0);
    }

    #[test]
    fn test_connection_outliving_signal() {
        let signal = Signal::<()>::new();
        let conn = signal.connect(|_| {});
        drop(signal);
        conn.disconnect();
    }
}
