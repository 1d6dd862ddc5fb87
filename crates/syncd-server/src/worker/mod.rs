//! The integration worker.
//!
//! One long-lived thread per process owns all writes to realm files. File
//! coordinators enqueue themselves (FIFO); the worker takes one
//! coordinator at a time, runs its in-flight work unit against the history
//! store, and finalizes. Units that requested compaction hand back to the
//! runtime's blocking pool instead, so the vacuum never stalls this shared
//! thread. Per-file exclusivity is enforced by the coordinator's
//! `has_work_in_progress` token, so a single queue entry per file is ever
//! outstanding.

pub mod pool;

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error};

pub use pool::{JobPool, PoolError, ScratchContext};

use crate::file::ServerFile;

/// State owned by the worker thread across work units.
pub struct WorkerState {
    /// Auxiliary pool for parallelizable sub-jobs.
    pub pool: Arc<JobPool>,
    /// Runtime handle for dispatching post-processing that must not run
    /// on the worker's own thread (compaction units).
    pub runtime: tokio::runtime::Handle,
}

struct Inner {
    tx: Option<mpsc::UnboundedSender<Arc<ServerFile>>>,
    join: Option<JoinHandle<()>>,
}

/// Handle to the integration worker thread.
pub struct Worker {
    inner: std::sync::Mutex<Inner>,
}

impl Worker {
    /// Start the worker thread.
    pub fn spawn(pool: Arc<JobPool>, runtime: tokio::runtime::Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = std::thread::Builder::new()
            .name("syncd-worker".to_owned())
            .spawn(move || worker_main(rx, pool, runtime))
            .map_err(|err| error!(error = %err, "failed to start integration worker"))
            .ok();
        Self {
            inner: std::sync::Mutex::new(Inner {
                tx: Some(tx),
                join,
            }),
        }
    }

    /// Queue a coordinator for processing. FIFO across files.
    pub fn enqueue(&self, file: Arc<ServerFile>) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = &inner.tx {
            let _ = tx.send(file);
        }
    }

    /// Stop accepting work, drain the queue, and join the thread.
    pub fn stop(&self) {
        let (tx, join) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            (inner.tx.take(), inner.join.take())
        };
        drop(tx);
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(
    mut rx: mpsc::UnboundedReceiver<Arc<ServerFile>>,
    pool: Arc<JobPool>,
    runtime: tokio::runtime::Handle,
) {
    let mut state = WorkerState { pool, runtime };
    debug!("integration worker started");
    while let Some(file) = rx.blocking_recv() {
        file.run_work_cycle(&mut state);
    }
    debug!("integration worker stopped");
}
