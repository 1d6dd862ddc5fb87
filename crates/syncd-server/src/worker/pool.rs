//! The auxiliary job pool.
//!
//! A bounded pool of lazily started threads for sub-jobs that the
//! integration worker wants off its own thread. Submission is cooperative:
//! when the queue grows past `10 x capacity`, the submitting thread runs
//! the job inline instead of queueing it, which bounds queue growth
//! without rejecting work.
//!
//! Job failures (including panics) are captured into a single stored
//! error; [`JobPool::wait_completion`] drains the pool and surfaces the
//! first one.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::warn;

/// Per-thread scratch space handed to every job.
#[derive(Debug, Default)]
pub struct ScratchContext {
    /// Reusable byte buffer; jobs may leave it in any state.
    pub buffer: Vec<u8>,
}

/// Failure of one pool job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool job failed: {0}")]
    Job(String),
    #[error("pool job panicked: {0}")]
    Panicked(String),
}

type Job = Box<dyn FnOnce(&mut ScratchContext) -> Result<(), PoolError> + Send + 'static>;

/// How many queued jobs per allowed thread before submitters run inline.
const SHED_FACTOR: usize = 10;

struct Queue {
    jobs: VecDeque<Job>,
    /// Threads started so far (never exceeds capacity).
    started: usize,
    /// Threads blocked waiting for a job.
    idle: usize,
    /// Jobs currently executing on pool threads.
    active: usize,
    stored_error: Option<PoolError>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
    capacity: usize,
}

/// Bounded auxiliary worker pool.
pub struct JobPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    /// Create a pool allowing up to `capacity` threads. Threads start
    /// lazily: only when a job is queued while no thread is idle.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    started: 0,
                    idle: 0,
                    active: 0,
                    stored_error: None,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                capacity: capacity.max(1),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Submit a job. Runs it inline on the calling thread when the queue
    /// is saturated.
    pub fn add_work(
        &self,
        job: impl FnOnce(&mut ScratchContext) -> Result<(), PoolError> + Send + 'static,
    ) {
        let job: Job = Box::new(job);
        let spawn_needed = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.jobs.len() >= SHED_FACTOR * self.shared.capacity {
                drop(queue);
                // Cooperative shedding: same execution and error capture as
                // a pool thread, on the submitter.
                let mut scratch = ScratchContext::default();
                let outcome = run_job(job, &mut scratch);
                self.shared.record_outcome(outcome);
                return;
            }
            queue.jobs.push_back(job);
            let spawn = queue.idle == 0 && queue.started < self.shared.capacity;
            if spawn {
                queue.started += 1;
            }
            spawn
        };
        if spawn_needed {
            self.spawn_thread();
        }
        self.shared.cond.notify_one();
    }

    /// Block until the queue is empty and no job is executing, then
    /// surface the first captured error, if any.
    pub fn wait_completion(&self) -> Result<(), PoolError> {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        while !queue.jobs.is_empty() || queue.active > 0 {
            queue = self
                .shared
                .cond
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
        match queue.stored_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_thread(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("syncd-pool".to_owned())
            .spawn(move || pool_thread(&shared));
        match handle {
            Ok(handle) => self
                .threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle),
            Err(err) => {
                warn!(error = %err, "failed to start pool thread");
                let mut queue = shared_queue(&self.shared);
                queue.started -= 1;
            }
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        {
            let mut queue = shared_queue(&self.shared);
            queue.shutdown = true;
        }
        self.shared.cond.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn record_outcome(&self, outcome: Result<(), PoolError>) {
        if let Err(err) = outcome {
            let mut queue = shared_queue(self);
            if queue.stored_error.is_none() {
                queue.stored_error = Some(err);
            }
        }
    }
}

fn shared_queue(shared: &Shared) -> std::sync::MutexGuard<'_, Queue> {
    shared.queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_job(job: Job, scratch: &mut ScratchContext) -> Result<(), PoolError> {
    match catch_unwind(AssertUnwindSafe(|| job(scratch))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic".to_owned());
            Err(PoolError::Panicked(message))
        }
    }
}

fn pool_thread(shared: &Shared) {
    let mut scratch = ScratchContext::default();
    let mut queue = shared_queue(shared);
    loop {
        if let Some(job) = queue.jobs.pop_front() {
            queue.active += 1;
            drop(queue);
            let outcome = run_job(job, &mut scratch);
            shared.record_outcome(outcome);
            queue = shared_queue(shared);
            queue.active -= 1;
            // Wake both idle workers and wait_completion callers.
            shared.cond.notify_all();
        } else {
            if queue.shutdown {
                break;
            }
            queue.idle += 1;
            queue = shared.cond.wait(queue).unwrap_or_else(|e| e.into_inner());
            queue.idle -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_and_completion_waits() {
        let pool = JobPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.add_work(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_completion().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn first_error_is_stored_and_rethrown() {
        let pool = JobPool::new(1);
        pool.add_work(|_| Err(PoolError::Job("first".to_owned())));
        pool.add_work(|_| Err(PoolError::Job("second".to_owned())));
        let err = pool.wait_completion().unwrap_err();
        assert_eq!(err, PoolError::Job("first".to_owned()));
        // The error was consumed; the pool is usable again.
        pool.add_work(|_| Ok(()));
        pool.wait_completion().unwrap();
    }

    #[test]
    fn panics_are_captured_not_propagated() {
        let pool = JobPool::new(1);
        pool.add_work(|_| panic!("boom"));
        let err = pool.wait_completion().unwrap_err();
        assert_eq!(err, PoolError::Panicked("boom".to_owned()));
    }

    #[test]
    fn saturated_queue_runs_inline() {
        let pool = JobPool::new(1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        // Park the single pool thread.
        {
            let gate = Arc::clone(&gate);
            pool.add_work(move |_| {
                let (lock, cond) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cond.wait(open).unwrap();
                }
                Ok(())
            });
        }
        // Give the pool thread time to pick the job up.
        std::thread::sleep(Duration::from_millis(50));
        // Fill the queue to the shedding threshold.
        let queued = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let queued = Arc::clone(&queued);
            pool.add_work(move |_| {
                queued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        // The next submission must run inline on this thread, immediately.
        let inline_ran = Arc::new(AtomicUsize::new(0));
        {
            let inline_ran = Arc::clone(&inline_ran);
            pool.add_work(move |_| {
                inline_ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(inline_ran.load(Ordering::SeqCst), 1);

        // Release the parked thread and drain.
        {
            let (lock, cond) = &*gate;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        pool.wait_completion().unwrap();
        assert_eq!(queued.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn scratch_context_is_reused_per_thread() {
        let pool = JobPool::new(1);
        pool.add_work(|scratch| {
            scratch.buffer.extend_from_slice(b"warm");
            Ok(())
        });
        pool.wait_completion().unwrap();
        let observed = Arc::new(AtomicUsize::new(0));
        {
            let observed = Arc::clone(&observed);
            pool.add_work(move |scratch| {
                observed.store(scratch.buffer.len(), Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_completion().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 4);
    }
}
