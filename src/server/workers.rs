//! Worker Pool
//!
//! Handler code runs here, never on the IO thread. The pool is the blocking
//! thread pool of a dedicated tokio runtime, capped at
//! [`ServerConfig::worker_threads`](super::ServerConfig::worker_threads)
//! threads; work beyond that waits in the runtime's queue.
//!
//! Every task is isolated: a panic is caught and logged and the thread goes
//! back to the pool. The pool counts tasks in flight so shutdown can wait for
//! them with a deadline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, warn};

use crate::util::lock;

pub(crate) struct WorkerPool {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the in-flight count when a task ends, even by panic.
struct InFlight(Arc<WorkerPool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut count = lock(&self.0.in_flight);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(name: &str, threads: usize) -> std::io::Result<Arc<Self>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(format!("{}-worker", name))
            .enable_all()
            .build()?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }))
    }

    /// Runs `task` on a worker thread. Returns false once the pool is closed.
    pub(crate) fn execute<F>(self: &Arc<Self>, name: &'static str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            debug!(task = name, "Worker pool closed, task rejected");
            return false;
        }

        *lock(&self.in_flight) += 1;
        let guard = InFlight(Arc::clone(self));
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(task = name, "Worker task panicked");
            }
        });
        true
    }

    pub(crate) fn in_flight(&self) -> usize {
        *lock(&self.in_flight)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further tasks.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Waits until no task is running, or `timeout` passes.
    pub(crate) fn await_idle(&self, timeout: Duration) -> bool {
        let count = lock(&self.in_flight);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }

    /// Closes the pool, waits up to `timeout` for running tasks and tears
    /// the runtime down. Must not be called from async code.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        self.close();
        if !self.await_idle(timeout) {
            warn!(
                pool = %self.name,
                in_flight = self.in_flight(),
                "Worker tasks still running after shutdown timeout"
            );
        }
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
        debug!(pool = %self.name, "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_runs_tasks_on_named_threads() {
        let pool = WorkerPool::new("unit", 2).unwrap();
        let (tx, rx) = mpsc::channel();

        assert!(pool.execute("name", move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("unit-worker"));
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_task_is_isolated() {
        let pool = WorkerPool::new("unit", 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.execute("boom", || panic!("handler bug"));
        let counter = Arc::clone(&ran);
        pool.execute("after", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.await_idle(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_flight(), 0);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_closed_pool_rejects_tasks() {
        let pool = WorkerPool::new("unit", 1).unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(!pool.execute("late", || {}));
        pool.shutdown(Duration::from_millis(10));
    }

    #[test]
    fn test_shutdown_waits_for_running_task() {
        let pool = WorkerPool::new("unit", 1).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        pool.execute("slow", move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        });

        pool.shutdown(Duration::from_secs(5));
        assert!(done.load(Ordering::SeqCst));
    }
}
