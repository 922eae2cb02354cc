//! Bounded worker pool for start/stop jobs.
//!
//! A fixed set of worker threads drains a bounded job queue. The dispatcher
//! submits one job per instance and awaits the drain between the stop and
//! start phases; submission blocks when the queue is full. Jobs capture
//! their inputs by value, so workers never touch shared mutable state except
//! through the job itself.
//!
//! A panicking job is contained: the panic is caught, logged, and counted as
//! a completed job so `wait_drain` cannot hang.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads with a bounded job queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
}

struct PoolState {
    queue: VecDeque<Job>,
    capacity: usize,
    in_flight: usize,
    closing: bool,
}

impl WorkerPool {
    /// Spawn a pool of `num_workers` threads with the given queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when a worker thread cannot be spawned;
    /// threads spawned up to that point are shut down again.
    pub fn spawn(num_workers: usize, queue_capacity: usize) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::with_capacity(queue_capacity),
                capacity: queue_capacity.max(1),
                in_flight: 0,
                closing: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
        });

        let pool = Self {
            inner,
            workers: Mutex::new(Vec::new()),
        };
        for index in 0..num_workers.max(1) {
            let inner = Arc::clone(&pool.inner);
            let worker = std::thread::Builder::new()
                .name(format!("launch-worker-{index}"))
                .spawn(move || worker_loop(&inner))
                .map_err(|err| Error::Internal(format!("failed to spawn worker: {err}")))?;
            pool.workers.lock().expect("lock poisoned").push(worker);
        }

        Ok(pool)
    }

    /// Submit a job, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the pool is shutting down.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");

        while state.queue.len() >= state.capacity && !state.closing {
            state = self
                .inner
                .not_full
                .wait(state)
                .expect("pool lock poisoned");
        }
        if state.closing {
            return Err(Error::Shutdown);
        }

        state.queue.push_back(Box::new(job));
        drop(state);
        self.inner.not_empty.notify_one();

        Ok(())
    }

    /// Block until the queue is empty and no job is in flight.
    pub fn wait_drain(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        while !state.queue.is_empty() || state.in_flight > 0 {
            state = self
                .inner
                .drained
                .wait(state)
                .expect("pool lock poisoned");
        }
    }

    /// Drain outstanding work and join the worker threads.
    ///
    /// Jobs already queued run to completion; new submissions are rejected.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.closing = true;
        }
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break job;
                }
                if state.closing {
                    return;
                }
                state = inner.not_empty.wait(state).expect("pool lock poisoned");
            }
        };
        inner.not_full.notify_one();

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job panicked in worker pool");
        }

        let mut state = inner.state.lock().expect("pool lock poisoned");
        state.in_flight -= 1;
        if state.queue.is_empty() && state.in_flight == 0 {
            debug!("worker pool drained");
            inner.drained.notify_all();
        }
    }
}
