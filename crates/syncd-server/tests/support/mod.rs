//! Shared fixtures for the server integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use syncd_core::ports::access::AllowAll;
use syncd_core::ports::history::{
    BootstrapError, ClientSessionBootstrap, ClientType, CompactStats, CompactionControl,
    DownloadInfo, FileIdentAllocSlot, HistoryFactory, HistoryStore, IntegratableChangesets,
    IntegrationOutcome, StoreError, VersionInfo,
};
use syncd_core::ports::metrics::NoopMetrics;
use syncd_core::protocol::messages::HistoryEntry;
use syncd_core::protocol::wire;
use syncd_core::{
    ClientMessage, DownloadCursor, FileIdent, SaltedFileIdent, SaltedVersion, ServerConfig,
    ServerMessage, SessionIdent, UploadChangeset, UploadCursor, Version, VirtualPath,
};
use syncd_server::{ChannelTransport, SyncServer};
use syncd_store::FileHistoryFactory;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub server: Arc<SyncServer>,
    pub root: TempDir,
}

impl TestServer {
    pub fn vpath(path: &str) -> VirtualPath {
        VirtualPath::parse(path).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// Start a server over a temp directory with permissive access control.
pub fn start_server(mut config: ServerConfig) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    config.root_dir = Some(root.path().to_path_buf());
    let server = SyncServer::start(
        config,
        Arc::new(AllowAll),
        Arc::new(NoopMetrics),
        Arc::new(FileHistoryFactory),
    )
    .unwrap();
    TestServer { server, root }
}

/// Start a server whose history stores can be gated (see [`Gate`]).
pub fn start_gated_server(mut config: ServerConfig) -> (TestServer, Gate) {
    let root = tempfile::tempdir().unwrap();
    config.root_dir = Some(root.path().to_path_buf());
    let gate = Gate::open();
    let server = SyncServer::start(
        config,
        Arc::new(AllowAll),
        Arc::new(NoopMetrics),
        Arc::new(GatedFactory {
            inner: FileHistoryFactory,
            gate: gate.clone(),
        }),
    )
    .unwrap();
    (TestServer { server, root }, gate)
}

// ── Test client ─────────────────────────────────────────────────────────────

/// A protocol client speaking over an in-process transport.
pub struct TestClient {
    transport: ChannelTransport,
}

impl TestClient {
    pub fn connect(server: &TestServer) -> Self {
        let (client_end, server_end) = ChannelTransport::pair();
        server.server.handle_connection(Box::new(server_end));
        Self {
            transport: client_end,
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        use syncd_core::ports::transport::Transport;
        self.transport
            .send_frame(wire::encode_client_message(message))
            .await
            .unwrap();
    }

    /// Receive the next server message, failing the test on timeout or
    /// stream end.
    pub async fn recv(&mut self) -> ServerMessage {
        use syncd_core::ports::transport::Transport;
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.transport.recv_frame())
            .await
            .expect("timed out waiting for a server message")
            .unwrap()
            .expect("server closed the connection");
        wire::decode_server_message(&frame).unwrap()
    }

    /// True when the server closed this connection (or sends nothing
    /// before `wait`).
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        use syncd_core::ports::transport::Transport;
        matches!(
            tokio::time::timeout(wait, self.transport.recv_frame()).await,
            Ok(Ok(None))
        )
    }

    pub async fn bind(&mut self, session_ident: SessionIdent, path: &str, need_ident: bool) {
        self.send(&ClientMessage::Bind {
            session_ident,
            path: path.to_owned(),
            signed_user_token: "test-token".to_owned(),
            need_client_file_ident: need_ident,
            is_subserver: false,
        })
        .await;
    }

    pub async fn ident(&mut self, session_ident: SessionIdent, ident: SaltedFileIdent) {
        self.send(&ClientMessage::Ident {
            session_ident,
            client_file_ident: ident.ident,
            client_file_ident_salt: ident.salt,
            scan_server_version: 0,
            scan_client_version: 0,
            latest_server_version: 0,
            latest_server_version_salt: 0,
        })
        .await;
    }

    /// BIND with allocation, IDENT from scratch, and swallow the initial
    /// empty DOWNLOAD. Returns the allocated identifier.
    pub async fn bind_fresh(
        &mut self,
        session_ident: SessionIdent,
        path: &str,
    ) -> SaltedFileIdent {
        self.bind(session_ident, path, true).await;
        let ident = match self.recv().await {
            ServerMessage::Ident {
                client_file_ident, ..
            } => client_file_ident,
            other => panic!("expected IDENT, got {other:?}"),
        };
        self.ident(session_ident, ident).await;
        match self.recv().await {
            ServerMessage::Download { .. } => {}
            other => panic!("expected initial DOWNLOAD, got {other:?}"),
        }
        ident
    }

    pub async fn upload_one(
        &mut self,
        session_ident: SessionIdent,
        client_version: Version,
        last_integrated_server_version: Version,
        data: &[u8],
    ) {
        self.send(&ClientMessage::Upload {
            session_ident,
            progress_client_version: client_version,
            progress_server_version: last_integrated_server_version,
            locked_server_version: 0,
            changesets: vec![UploadChangeset {
                upload_cursor: UploadCursor::new(client_version, last_integrated_server_version),
                origin_timestamp: 1,
                origin_file_ident: 0,
                data: data.to_vec(),
            }],
        })
        .await;
    }

    /// Receive messages until a DOWNLOAD arrives; panics on anything that
    /// is not a DOWNLOAD.
    pub async fn expect_download(&mut self) -> Download {
        match self.recv().await {
            ServerMessage::Download {
                session_ident,
                progress,
                end,
                upload_progress,
                downloadable_bytes,
                num_changesets,
                body,
            } => {
                let raw = if body.is_compressed {
                    wire::decompress(&body.bytes, body.uncompressed_size).unwrap()
                } else {
                    body.bytes.clone()
                };
                let entries =
                    wire::decode_history_entries(&raw, num_changesets as usize).unwrap();
                Download {
                    session_ident,
                    progress,
                    end,
                    upload_progress,
                    downloadable_bytes,
                    entries,
                }
            }
            other => panic!("expected DOWNLOAD, got {other:?}"),
        }
    }

    pub async fn expect_error(&mut self) -> (SessionIdent, u32, bool) {
        match self.recv().await {
            ServerMessage::Error {
                session_ident,
                error_code,
                try_again,
                ..
            } => (session_ident, error_code, try_again),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }
}

/// A decoded DOWNLOAD with its entries inflated.
#[derive(Debug)]
pub struct Download {
    pub session_ident: SessionIdent,
    pub progress: DownloadCursor,
    pub end: SaltedVersion,
    pub upload_progress: UploadCursor,
    pub downloadable_bytes: u64,
    pub entries: Vec<HistoryEntry>,
}

// ── Gated history store ─────────────────────────────────────────────────────

/// A shared open/closed gate. While closed, gated stores block inside
/// `integrate_client_changesets`, which pins the coordinator in its
/// in-flight state for as long as the test needs. The gate also counts
/// concurrent integrations so tests can assert single-writer discipline.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
    active: Arc<std::sync::atomic::AtomicUsize>,
    max_observed: Arc<std::sync::atomic::AtomicUsize>,
}

impl Gate {
    pub fn open() -> Self {
        Self {
            inner: Arc::new((Mutex::new(true), Condvar::new())),
            active: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            max_observed: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// Highest integration concurrency ever observed through this gate.
    pub fn max_observed_integrations(&self) -> usize {
        self.max_observed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn close(&self) {
        *self.inner.0.lock().unwrap() = false;
    }

    pub fn release(&self) {
        *self.inner.0.lock().unwrap() = true;
        self.inner.1.notify_all();
    }

    fn wait_open(&self) {
        let (lock, cond) = &*self.inner;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cond.wait(open).unwrap();
        }
    }
}

pub struct GatedFactory {
    pub inner: FileHistoryFactory,
    pub gate: Gate,
}

impl HistoryFactory for GatedFactory {
    fn open(&self, real_path: &std::path::Path) -> Result<Arc<dyn HistoryStore>, StoreError> {
        let inner = self.inner.open(real_path)?;
        Ok(Arc::new(GatedStore {
            inner,
            gate: self.gate.clone(),
        }))
    }
}

pub struct GatedStore {
    inner: Arc<dyn HistoryStore>,
    gate: Gate,
}


impl HistoryStore for GatedStore {
    fn get_status(&self) -> Result<VersionInfo, StoreError> {
        self.inner.get_status()
    }

    fn bootstrap_client_session(
        &self,
        client_file_ident: SaltedFileIdent,
        download_progress: DownloadCursor,
        latest_server_version: SaltedVersion,
        client_type: ClientType,
    ) -> Result<ClientSessionBootstrap, BootstrapError> {
        self.inner.bootstrap_client_session(
            client_file_ident,
            download_progress,
            latest_server_version,
            client_type,
        )
    }

    fn integrate_client_changesets(
        &self,
        batch: &IntegratableChangesets,
    ) -> Result<IntegrationOutcome, StoreError> {
        use std::sync::atomic::Ordering;
        let current = self.gate.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.max_observed.fetch_max(current, Ordering::SeqCst);
        self.gate.wait_open();
        let result = self.inner.integrate_client_changesets(batch);
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn allocate_file_identifiers(
        &self,
        slots: &mut [FileIdentAllocSlot],
        version_info: &mut VersionInfo,
    ) -> Result<(), StoreError> {
        self.inner.allocate_file_identifiers(slots, version_info)
    }

    fn fetch_download_info(
        &self,
        client_file_ident: FileIdent,
        download_progress: &mut DownloadCursor,
        end_version: Version,
        max_size: usize,
        handler: &mut dyn FnMut(&HistoryEntry),
    ) -> Result<Option<DownloadInfo>, StoreError> {
        self.inner.fetch_download_info(
            client_file_ident,
            download_progress,
            end_version,
            max_size,
            handler,
        )
    }

    fn compact(&self, control: &CompactionControl) -> Result<CompactStats, StoreError> {
        self.inner.compact(control)
    }

    fn reopen_after_compaction(&self) -> Result<(), StoreError> {
        self.inner.reopen_after_compaction()
    }

    fn close_for_deletion(&self) {
        self.inner.close_for_deletion();
    }
}
