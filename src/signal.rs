//! Observer lists with dispatched delivery.
//!
//! A [`Signal<E>`] holds the subscribers for one event type and delivers every
//! emitted event through a [`Dispatcher`]. Each device type declares its own
//! event enum (`PvEvent`, `ShutterEvent`, `GonioEvent`, ...) so the set of
//! notifications a device can produce is fixed at compile time.
//!
//! Each invocation runs under a read guard of the subscriber's gate and checks
//! the subscriber's active flag inside it. Unsubscribing clears the flag and,
//! off the dispatch thread, takes the gate's write guard, so it waits for an
//! invocation already in progress. Once [`Signal::unsubscribe`] returns, the
//! callback will not be entered again, even for events emitted before the call
//! that are still waiting in the queue. A callback unsubscribing itself on the
//! dispatch thread returns at once and finishes its current invocation.

use crate::dispatch::Dispatcher;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`Signal::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn Fn(&E) + Send + Sync + 'static>;

struct Subscriber<E> {
    id: SubscriptionId,
    active: AtomicBool,
    gate: RwLock<()>,
    callback: Callback<E>,
}

impl<E> Subscriber<E> {
    /// Stop future invocations, waiting out one in progress on another thread.
    fn deactivate(&self, dispatcher: &Dispatcher) {
        self.active.store(false, Ordering::SeqCst);
        if !dispatcher.is_dispatch_thread() {
            drop(self.gate.write());
        }
    }
}

/// Observer list for events of type `E`.
pub struct Signal<E> {
    dispatcher: Dispatcher,
    subscribers: RwLock<Vec<Arc<Subscriber<E>>>>,
    next_id: AtomicU64,
}

impl<E> std::fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}

impl<E> Signal<E>
where
    E: Send + Sync + 'static,
{
    /// Create an empty signal delivering on `dispatcher`.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The dispatch context this signal delivers on.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a callback for every future emission.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            gate: RwLock::new(()),
            callback: Box::new(callback),
        }));
        id
    }

    /// Remove a subscription. Idempotent; returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscribers = self.subscribers.write();
            subscribers
                .iter()
                .position(|s| s.id == id)
                .map(|index| subscribers.remove(index))
        };
        match removed {
            Some(subscriber) => {
                subscriber.deactivate(&self.dispatcher);
                true
            }
            None => false,
        }
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        let removed: Vec<_> = self.subscribers.write().drain(..).collect();
        for subscriber in removed {
            subscriber.deactivate(&self.dispatcher);
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Queue delivery of `event` to the current subscribers.
    ///
    /// Returns immediately; callbacks run later on the dispatch thread.
    pub fn emit(&self, event: E) {
        self.emit_all(vec![event]);
    }

    /// Queue several events as one dispatch job, delivered in order.
    pub fn emit_all(&self, events: Vec<E>) {
        let targets: Vec<_> = self.subscribers.read().iter().cloned().collect();
        if targets.is_empty() || events.is_empty() {
            return;
        }
        self.dispatcher.post(move || {
            for event in &events {
                for subscriber in &targets {
                    let _running = subscriber.gate.read();
                    if !subscriber.active.load(Ordering::SeqCst) {
                        continue;
                    }
                    let call = AssertUnwindSafe(|| (subscriber.callback)(event));
                    if catch_unwind(call).is_err() {
                        tracing::error!(
                            subscription = subscriber.id.0,
                            "Subscriber callback panicked"
                        );
                    }
                }
            }
        });
    }
}

impl<E> Drop for Signal<E> {
    fn drop(&mut self) {
        for subscriber in self.subscribers.get_mut().drain(..) {
            subscriber.deactivate(&self.dispatcher);
        }
    }
}
