//! Fixed-size worker pool draining one shared task queue.
//!
//! One queue, one mutex, one not-empty condition, one closed flag. Workers
//! dequeue under the lock, release it for the duration of the task, then
//! reacquire before looking again, so queue depth is a true backlog signal.
//! Shutdown closes the queue and wakes everyone; whatever is still queued
//! drains before the workers exit.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};

use tracing::{debug, trace};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    not_empty: Condvar,
}

/// Worker thread set. Dropping the pool closes the queue, wakes all workers
/// and joins them.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `count` named worker threads.
    pub fn new(count: usize) -> io::Result<Self> {
        debug_assert!(count > 0, "pool needs at least one worker");
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || worker_loop(i, &shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Enqueue a task and signal one waiting worker. Tasks submitted after
    /// shutdown began are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut state) = self.shared.state.lock() {
            if state.closed {
                return;
            }
            state.tasks.push_back(Box::new(task));
            drop(state);
            self.shared.not_empty.notify_one();
        }
    }

    /// Tasks currently queued (not counting ones being run).
    pub fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.tasks.len())
            .unwrap_or(0)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.closed = true;
        }
        self.shared.not_empty.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    debug!(worker = id, "Worker thread started");
    let mut state = match shared.state.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            trace!(worker = id, "Running task");
            task();
            state = match shared.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
        } else if state.closed {
            break;
        } else {
            state = match shared.not_empty.wait(state) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }
    debug!(worker = id, "Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_all_submitted_tasks_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4).unwrap();

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_in_flight_tasks_complete_on_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(2).unwrap();

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(30));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_workers_run_concurrently() {
        let barrier = Arc::new(Barrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4).unwrap();

        // All four must rendezvous, which only works if four distinct
        // workers pick up a task each.
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                barrier.wait();
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backlog_drains_with_single_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(1).unwrap();

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
