//! Single-threaded dispatch context.
//!
//! Hardware channels deliver notifications on their own threads. Subscriber
//! callbacks must never run there, and must never run concurrently with one
//! another, so every notification is posted to a [`Dispatcher`]: a message queue
//! drained by one dedicated worker thread.
//!
//! The queue is the only structure mutated by several hardware threads at once.
//! Enqueue and dequeue are synchronized; callback execution is not.
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::new("pv-dispatch")?;
//! dispatcher.post(|| tracing::info!("runs on the dispatch thread"));
//! dispatcher.flush(Duration::from_secs(1));
//! ```

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;

/// A unit of work executed on the dispatch thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the dispatch context. Clones share the same worker thread.
///
/// The worker exits once every handle has been dropped and the queue is drained.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: mpsc::UnboundedSender<Job>,
    thread_id: ThreadId,
    name: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Spawn the dispatch thread.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (queue, mut rx) = mpsc::unbounded_channel::<Job>();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Subscriber callback panicked on the dispatch thread");
                }
            }
            tracing::debug!("Dispatch queue closed");
        })?;

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                queue,
                thread_id: handle.thread().id(),
                name,
            }),
        })
    }

    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a job. Never blocks and never runs the job on the calling thread.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.queue.send(Box::new(job)).is_err() {
            tracing::warn!(dispatcher = %self.inner.name, "Dispatch thread is gone; dropping job");
        }
    }

    /// Whether the caller is running on the dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Block until every job queued before this call has run.
    ///
    /// Returns `false` on timeout, or immediately when called from the dispatch
    /// thread itself (waiting there would deadlock).
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_dispatch_thread() {
            tracing::warn!("flush() called from the dispatch thread");
            return false;
        }

        let latch = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = latch.clone();
        self.post(move || {
            let (done, cvar) = &*signal;
            *done.lock() = true;
            cvar.notify_all();
        });

        let (done, cvar) = &*latch;
        let mut guard = done.lock();
        if !*guard {
            cvar.wait_for(&mut guard, timeout);
        }
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_order_on_the_worker() {
        let dispatcher = Dispatcher::new("test-dispatch").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            let d = dispatcher.clone();
            dispatcher.post(move || {
                assert!(d.is_dispatch_thread());
                seen.lock().push(i);
            });
        }
        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert!(!dispatcher.is_dispatch_thread());
    }

    #[test]
    fn panicking_job_does_not_stop_the_worker() {
        let dispatcher = Dispatcher::new("test-dispatch").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.post(|| panic!("boom"));
        let c = count.clone();
        dispatcher.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posting_from_many_threads() {
        let dispatcher = Dispatcher::new("test-dispatch").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = dispatcher.clone();
                let c = count.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        let c = c.clone();
                        d.post(move || {
                            c.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(dispatcher.flush(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }
}
