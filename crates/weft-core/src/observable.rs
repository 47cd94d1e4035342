//! Observable event sinks
//!
//! Invocation lists of callbacks in registration order. [`Observable`] is
//! synchronous fire-and-forget; [`AsyncObservable`] awaits each listener in
//! sequence before `emit` returns.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Handle returned by `on`, used to deregister a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type AsyncListener<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Listeners<L> {
    next_id: u64,
    entries: Vec<(u64, L)>,
}

impl<L> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<L> Listeners<L> {
    fn add(&mut self, listener: L) -> ListenerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        ListenerHandle(id)
    }

    fn remove(&mut self, handle: ListenerHandle) {
        self.entries.retain(|(id, _)| *id != handle.0);
    }
}

/// Synchronous observable; listeners run inline on emit, in registration
/// order.
pub struct Observable<T> {
    listeners: Mutex<Listeners<Listener<T>>>,
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Listeners::default()),
        }
    }

    /// Register a listener; returns a handle for [`off`](Self::off).
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        self.listeners.lock().add(Arc::new(listener))
    }

    /// Deregister a listener.
    pub fn off(&self, handle: ListenerHandle) {
        self.listeners.lock().remove(handle);
    }

    /// Invoke all listeners with `args`.
    pub fn emit(&self, args: &T) {
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(args);
        }
    }

    pub fn is_observed(&self) -> bool {
        !self.listeners.lock().entries.is_empty()
    }
}

/// Asynchronous observable; emit awaits each listener in registration
/// order before returning.
pub struct AsyncObservable<T> {
    listeners: Mutex<Listeners<AsyncListener<T>>>,
}

impl<T: Clone> Default for AsyncObservable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> AsyncObservable<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Listeners::default()),
        }
    }

    /// Register an async listener; returns a handle for [`off`](Self::off).
    pub fn on<F, Fut>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listeners
            .lock()
            .add(Arc::new(move |args| Box::pin(listener(args))))
    }

    /// Deregister a listener.
    pub fn off(&self, handle: ListenerHandle) {
        self.listeners.lock().remove(handle);
    }

    /// Invoke and await all listeners in order.
    pub async fn emit(&self, args: T) {
        let listeners: Vec<AsyncListener<T>> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(args.clone()).await;
        }
    }

    pub fn is_observed(&self) -> bool {
        !self.listeners.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_emit_in_registration_order() {
        let observable = Observable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for marker in 0..3u32 {
            let seen = seen.clone();
            observable.on(move |v| seen.lock().push((marker, *v)));
        }

        observable.emit(&7);
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_off_removes_listener() {
        let observable = Observable::<()>::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let handle = observable.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        observable.emit(&());
        observable.off(handle);
        observable.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!observable.is_observed());
    }

    #[tokio::test]
    async fn test_async_emit_awaits_in_order() {
        let observable = AsyncObservable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for marker in 0..2u32 {
            let seen = seen.clone();
            observable.on(move |v: u32| {
                let seen = seen.clone();
                async move {
                    tokio::task::yield_now().await;
                    seen.lock().push((marker, v));
                }
            });
        }

        observable.emit(9).await;
        assert_eq!(*seen.lock(), vec![(0, 9), (1, 9)]);
    }
}
