//! The server root.
//!
//! [`SyncServer`] holds the registry of open realm files, the integration
//! worker and auxiliary pool, the connection map, and the global gauges,
//! and orchestrates admin-initiated compaction and deletion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use syncd_core::ports::access::AccessControl;
use syncd_core::ports::history::{HistoryFactory, StoreError};
use syncd_core::ports::metrics::{names, MetricsSink};
use syncd_core::ports::transport::Transport;
use syncd_core::{ServerConfig, VirtualPath};

use crate::connection::Connection;
use crate::file::ServerFile;
use crate::session::handle::{ConnId, ConnSignal};
use crate::worker::{JobPool, Worker};

/// Server-level failures surfaced to adapters.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no realm at this path")]
    RealmNotFound,
    #[error("a compaction round is already in progress")]
    CompactionBusy,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Summary served by `GET /api/info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerInfo {
    pub num_connections: usize,
    pub realms: Vec<String>,
}

struct ConnEntry {
    ctl: mpsc::UnboundedSender<ConnSignal>,
}

/// The server root singleton. Constructed by [`SyncServer::start`]; all
/// state is torn down when the last `Arc` drops after `shutdown`.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    root_dir: PathBuf,
    access: Arc<dyn AccessControl>,
    metrics: Arc<dyn MetricsSink>,
    history_factory: Arc<dyn HistoryFactory>,
    files: Mutex<HashMap<VirtualPath, Arc<ServerFile>>>,
    connections: Mutex<HashMap<ConnId, ConnEntry>>,
    worker: Worker,
    next_conn_id: AtomicU64,
    /// Guards the admin compaction round; at most one at a time.
    compaction_in_progress: AtomicBool,
    shutdown_token: CancellationToken,
}

impl SyncServer {
    /// Construct and start the server: validates configuration, creates
    /// the realm root directory, and starts the worker threads. Must be
    /// called from within a tokio runtime; compaction post-processing is
    /// dispatched onto its blocking pool.
    pub fn start(
        config: ServerConfig,
        access: Arc<dyn AccessControl>,
        metrics: Arc<dyn MetricsSink>,
        history_factory: Arc<dyn HistoryFactory>,
    ) -> Result<Arc<Self>, ServerError> {
        let root_dir = config
            .root_dir
            .clone()
            .ok_or_else(|| ServerError::Config("root_dir is required".to_owned()))?;
        std::fs::create_dir_all(&root_dir).map_err(StoreError::Io)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ServerError::Config("a tokio runtime is required".to_owned()))?;
        let pool = Arc::new(JobPool::new(config.effective_aux_workers()));
        let worker = Worker::spawn(pool, runtime);
        info!(root = %root_dir.display(), "sync server started");
        Ok(Arc::new(Self {
            config: Arc::new(config),
            root_dir,
            access,
            metrics,
            history_factory,
            files: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            worker,
            next_conn_id: AtomicU64::new(1),
            compaction_in_progress: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root_dir
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    // ── Realm registry ──────────────────────────────────────────────────────

    /// Idempotently open the coordinator for a virtual path, creating
    /// parent directories and the realm file on first use.
    pub fn get_or_create_file(
        self: &Arc<Self>,
        virtual_path: &VirtualPath,
    ) -> Result<Arc<ServerFile>, ServerError> {
        if self.shutdown_token.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        let mut files = self.lock_files();
        if let Some(file) = files.get(virtual_path) {
            return Ok(Arc::clone(file));
        }

        let real_path = virtual_path.real_path(&self.root_dir);
        if let Some(parent) = real_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let history = self.history_factory.open(&real_path)?;
        let file = Arc::new(ServerFile::new(
            virtual_path.clone(),
            self.root_dir.clone(),
            history,
            Arc::downgrade(self),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        ));
        file.activate()?;
        files.insert(virtual_path.clone(), Arc::clone(&file));
        self.metrics.gauge_add(names::REALMS_OPEN, 1.0);
        debug!(path = %virtual_path, "realm coordinator created");
        Ok(file)
    }

    /// Look up an open coordinator without creating one.
    pub fn lookup_file(&self, virtual_path: &VirtualPath) -> Option<Arc<ServerFile>> {
        self.lock_files().get(virtual_path).cloned()
    }

    /// Called by `perform_file_deletion`; may drop the last registry
    /// reference to the coordinator.
    pub(crate) fn unregister_file(&self, virtual_path: &VirtualPath) {
        if self.lock_files().remove(virtual_path).is_some() {
            self.metrics.gauge_add(names::REALMS_OPEN, -1.0);
        }
    }

    pub(crate) fn enqueue_work(&self, file: Arc<ServerFile>) {
        self.worker.enqueue(file);
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<VirtualPath, Arc<ServerFile>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Connections ─────────────────────────────────────────────────────────

    /// Adopt a framed transport as a new sync connection; returns its id.
    pub fn handle_connection(self: &Arc<Self>, transport: Box<dyn Transport>) -> ConnId {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, Arc::clone(self), transport);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                ConnEntry {
                    ctl: connection.ctl_sender(),
                },
            );
        connection.spawn();
        id
    }

    pub(crate) fn unregister_connection(&self, id: ConnId) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    // ── Admin orchestration ─────────────────────────────────────────────────

    /// Delete one realm: drives bound sessions through
    /// `server_file_deleted`, removes the file and empty parents, and
    /// resolves once the coordinator is unregistered.
    pub async fn delete_realm(self: &Arc<Self>, virtual_path: &VirtualPath) -> Result<(), ServerError> {
        let file = match self.lookup_file(virtual_path) {
            Some(file) => file,
            None => {
                // Not open; only delete what actually exists on disk.
                if !virtual_path.real_path(&self.root_dir).exists() {
                    return Err(ServerError::RealmNotFound);
                }
                self.get_or_create_file(virtual_path)?
            }
        };
        let (tx, rx) = oneshot::channel();
        file.initiate_deletion(Some(tx));
        rx.await.map_err(|_| ServerError::ShuttingDown)
    }

    /// Compact one realm, or every open realm when `virtual_path` is
    /// `None`. Resolves when all targeted compactions finished; fails
    /// fast when a round is already running.
    pub async fn compact_realms(
        self: &Arc<Self>,
        virtual_path: Option<&VirtualPath>,
    ) -> Result<(), ServerError> {
        let targets: Vec<Arc<ServerFile>> = match virtual_path {
            Some(path) => vec![self.lookup_file(path).ok_or(ServerError::RealmNotFound)?],
            None => self.lock_files().values().cloned().collect(),
        };
        if self
            .compaction_in_progress
            .swap(true, Ordering::AcqRel)
        {
            return Err(ServerError::CompactionBusy);
        }

        let mut waiters = Vec::with_capacity(targets.len());
        for file in &targets {
            let (tx, rx) = oneshot::channel();
            file.initiate_compaction(Some(tx));
            waiters.push(rx);
        }
        for waiter in waiters {
            let _ = waiter.await;
        }
        self.compaction_in_progress.store(false, Ordering::Release);
        info!(count = targets.len(), "compaction round finished");
        Ok(())
    }

    /// Summary for `GET /api/info`.
    pub fn info(&self) -> ServerInfo {
        let mut realms: Vec<String> = self
            .lock_files()
            .keys()
            .map(|path| path.as_str().to_owned())
            .collect();
        realms.sort();
        ServerInfo {
            num_connections: self
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            realms,
        }
    }

    /// Terminate every connection, stop the worker, and refuse further
    /// realm opens.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        let connections = std::mem::take(
            &mut *self.connections.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (_, entry) in connections {
            let _ = entry.ctl.send(ConnSignal::Terminate);
        }
        self.worker.stop();
        info!("sync server stopped");
    }
}
