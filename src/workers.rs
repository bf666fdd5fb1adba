//! Bounded worker pool with two priority queues
//!
//! High priority carries query work, low priority carries background
//! indexing and repair. With zero threads every job runs in place on the
//! submitting thread, which serializes writes and queries per index.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<Job>,
    low: VecDeque<Job>,
    target_threads: usize,
    live_threads: usize,
    running: usize,
    shutdown: bool,
    spawned_total: usize,
}

impl Queues {
    fn pop(&mut self) -> Option<Job> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    fn is_idle(&self) -> bool {
        self.high.is_empty() && self.low.is_empty() && self.running == 0
    }
}

struct Shared {
    queues: Mutex<Queues>,
    work_ready: Condvar,
    idle: Condvar,
}

/// Worker pool handle; cloning shares the same pool
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                work_ready: Condvar::new(),
                idle: Condvar::new(),
            }),
        };
        pool.resize(threads);
        pool
    }

    /// Target number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.queues.lock().target_threads
    }

    pub fn is_in_place(&self) -> bool {
        self.thread_count() == 0
    }

    /// Change the worker count at runtime. Surplus threads exit after
    /// finishing their current job.
    pub fn resize(&self, threads: usize) {
        let mut queues = self.shared.queues.lock();
        queues.target_threads = threads;
        while queues.live_threads < threads {
            queues.live_threads += 1;
            queues.spawned_total += 1;
            let shared = self.shared.clone();
            let name = format!("hybridex-worker-{}", queues.spawned_total);
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                queues.live_threads -= 1;
                tracing::error!(error = %e, "Failed to spawn worker thread");
                break;
            }
        }
        drop(queues);
        self.shared.work_ready.notify_all();

        // Jobs queued before switching to in-place mode still need to run.
        if threads == 0 {
            self.drain_in_place();
        }
        tracing::debug!(threads, "Worker pool resized");
    }

    /// Submit a job; runs immediately when the pool has no threads.
    pub fn submit<F>(&self, priority: Priority, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queues = self.shared.queues.lock();
        if queues.target_threads == 0 || queues.shutdown {
            drop(queues);
            run_job(Box::new(job));
            return;
        }
        match priority {
            Priority::High => queues.high.push_back(Box::new(job)),
            Priority::Low => queues.low.push_back(Box::new(job)),
        }
        drop(queues);
        self.shared.work_ready.notify_one();
    }

    /// Number of queued jobs, per priority.
    pub fn pending(&self) -> (usize, usize) {
        let queues = self.shared.queues.lock();
        (queues.high.len(), queues.low.len())
    }

    /// Block until every queued and running job has finished.
    pub fn wait_idle(&self) {
        let mut queues = self.shared.queues.lock();
        while !queues.is_idle() && queues.live_threads > 0 {
            self.shared.idle.wait(&mut queues);
        }
        drop(queues);
        self.drain_in_place();
    }

    /// Stop all threads; later submissions run in place.
    pub fn shutdown(&self) {
        let mut queues = self.shared.queues.lock();
        queues.shutdown = true;
        queues.target_threads = 0;
        drop(queues);
        self.shared.work_ready.notify_all();
        self.drain_in_place();
    }

    fn drain_in_place(&self) {
        loop {
            let job = {
                let mut queues = self.shared.queues.lock();
                if queues.live_threads > 0 && !queues.shutdown {
                    return;
                }
                queues.pop()
            };
            match job {
                Some(job) => run_job(job),
                None => return,
            }
        }
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("Background job panicked");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut queues = shared.queues.lock();
    loop {
        if queues.shutdown || queues.live_threads > queues.target_threads {
            queues.live_threads -= 1;
            if queues.is_idle() || queues.live_threads == 0 {
                shared.idle.notify_all();
            }
            return;
        }
        match queues.pop() {
            Some(job) => {
                queues.running += 1;
                drop(queues);
                run_job(job);
                queues = shared.queues.lock();
                queues.running -= 1;
                if queues.is_idle() {
                    shared.idle.notify_all();
                }
            }
            None => shared.work_ready.wait(&mut queues),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let queues = self.queues.get_mut();
        queues.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_in_place_runs_synchronously() {
        let pool = WorkerPool::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(Priority::Low, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_threads_drain_all_jobs() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let c = counter.clone();
            let priority = if i % 2 == 0 { Priority::High } else { Priority::Low };
            pool.submit(priority, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.shutdown();
    }

    #[test]
    fn test_resize_to_zero_runs_pending_in_place() {
        let pool = WorkerPool::new(2);
        pool.resize(0);
        assert!(pool.is_in_place());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(Priority::High, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pool() {
        let pool = WorkerPool::new(1);
        pool.submit(Priority::Low, || panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(Priority::Low, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}
