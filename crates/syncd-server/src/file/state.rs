//! Pure coordinator state.
//!
//! This is a synchronous state machine with no locking and no I/O; the
//! [`ServerFile`](super::ServerFile) orchestrator holds it behind a mutex
//! and is responsible for everything that touches channels, the history
//! store, or the filesystem.
//!
//! The coordinator is in one of four implicit states:
//!
//! - **Idle**: `!has_blocked_work && !has_work_in_progress`
//! - **Blocked-accumulating**: `has_blocked_work && !has_work_in_progress`
//! - **In-flight**: `has_work_in_progress` (work owned by the worker)
//! - **Post-processing**: worker returned, results merging back

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::oneshot;

use syncd_core::ports::history::{
    ClientType, FileIdentAllocSlot, IntegratableChangesets, VersionInfo,
};
use syncd_core::protocol::messages::{DownloadBody, UploadChangeset};
use syncd_core::{
    DownloadCursor, FileIdent, RequestIdent, SessionIdent, Timestamp, UploadCursor, Version,
};

use crate::session::handle::{ConnId, SessionHandle};
use crate::file::work::WorkUnit;

/// Callback invoked with the allocated identifier during post-processing.
pub type IdentReceiver = Box<dyn FnOnce(syncd_core::SaltedFileIdent) + Send + 'static>;

/// One outstanding file-ident allocation request.
pub struct IdentRequest {
    /// `None` after cancellation; the slot is still allocated and reaped
    /// when its work unit post-processes.
    pub receiver: Option<IdentReceiver>,
    pub proxy_file: Option<FileIdent>,
    pub client_type: ClientType,
}

/// Cached DOWNLOAD for the "fresh client from version 0" fast path.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    /// Sync version the cached body converges to; the cache key.
    pub end_version: Version,
    pub progress: DownloadCursor,
    pub num_changesets: u64,
    pub downloadable_bytes: u64,
    pub body: DownloadBody,
}

/// All protocol-visible state of one realm file coordinator.
pub struct CoordinatorState {
    /// Latest snapshot advertised to clients. Mutated only during
    /// post-processing; observers see a non-decreasing sync version.
    pub version_info: VersionInfo,

    /// Sessions post-BIND, pre-IDENT.
    pub unidentified_sessions: HashMap<(ConnId, SessionIdent), SessionHandle>,
    /// Sessions bound to a client file.
    pub identified_sessions: BTreeMap<FileIdent, SessionHandle>,

    /// Outstanding allocation requests in issue order.
    pub file_ident_requests: BTreeMap<RequestIdent, IdentRequest>,
    next_request_ident: RequestIdent,

    /// Inbound changesets accumulated while a work unit is in flight (or
    /// while idle, momentarily, until the next unblock).
    pub blocked_changesets: IntegratableChangesets,
    /// Bytes on the blocked side; the backpressure counter.
    pub blocked_bytes: u64,
    /// Bytes moved to the in-flight side, not yet finalized.
    pub unblocked_bytes: u64,

    pub has_blocked_work: bool,
    pub has_work_in_progress: bool,
    pub request_compaction: bool,
    pub request_deletion: bool,
    /// Deletion accepted; new binds are refused from this point on.
    pub deletion_is_ongoing: bool,
    /// Deletion finished; late waiters resolve immediately.
    pub deletion_completed: bool,

    /// Read-only view of the in-flight batch for concurrent bootstraps.
    pub in_flight_changesets: Option<Arc<IntegratableChangesets>>,

    pub download_cache: Option<DownloadCache>,

    /// Last time each client file touched this file. Maintained only when
    /// history TTL compaction is enabled.
    pub last_client_accesses: BTreeMap<FileIdent, Timestamp>,

    /// Admin waiters released when deletion completes.
    pub deletion_waiters: Vec<oneshot::Sender<()>>,
    /// Admin waiters released when the requested compaction finishes.
    pub compaction_waiters: Vec<oneshot::Sender<()>>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self {
            version_info: VersionInfo::default(),
            unidentified_sessions: HashMap::new(),
            identified_sessions: BTreeMap::new(),
            file_ident_requests: BTreeMap::new(),
            next_request_ident: 1,
            blocked_changesets: IntegratableChangesets::new(),
            blocked_bytes: 0,
            unblocked_bytes: 0,
            has_blocked_work: false,
            has_work_in_progress: false,
            request_compaction: false,
            request_deletion: false,
            deletion_is_ongoing: false,
            deletion_completed: false,
            in_flight_changesets: None,
            download_cache: None,
            last_client_accesses: BTreeMap::new(),
            deletion_waiters: Vec::new(),
            compaction_waiters: Vec::new(),
        }
    }

    /// Record an allocation request; returns its strictly increasing id.
    pub fn add_ident_request(&mut self, request: IdentRequest) -> RequestIdent {
        let ident = self.next_request_ident;
        self.next_request_ident += 1;
        self.file_ident_requests.insert(ident, request);
        ident
    }

    /// Null out a request's receiver. The slot itself is reaped when the
    /// work unit that allocates it post-processes.
    pub fn cancel_ident_request(&mut self, ident: RequestIdent) {
        if let Some(request) = self.file_ident_requests.get_mut(&ident) {
            request.receiver = None;
        }
    }

    /// Append inbound changesets to the blocked side, monotonically
    /// raising the stored cursors. Returns the bytes added.
    pub fn queue_changesets(
        &mut self,
        client_file_ident: FileIdent,
        upload_progress: UploadCursor,
        locked_server_version: Version,
        changesets: Vec<UploadChangeset>,
    ) -> u64 {
        let list = self.blocked_changesets.entry(client_file_ident).or_default();
        let bytes: u64 = changesets.iter().map(UploadChangeset::byte_size).sum();
        list.changesets.extend(changesets);
        list.upload_progress.raise_to(&upload_progress);
        list.locked_server_version = list.locked_server_version.max(locked_server_version);
        self.blocked_bytes += bytes;
        bytes
    }

    /// Drop the blocked entry for one client file (after its changesets
    /// were excluded by integration). Returns the bytes released.
    pub fn drop_blocked_entry(&mut self, client_file_ident: FileIdent) -> u64 {
        match self.blocked_changesets.remove(&client_file_ident) {
            Some(list) => {
                let bytes = list.byte_size();
                self.blocked_bytes -= bytes;
                bytes
            }
            None => 0,
        }
    }

    /// Move the blocked side into a fresh work unit and mark it in flight.
    ///
    /// Must only be called when no work is in progress.
    pub fn take_work(&mut self) -> WorkUnit {
        debug_assert!(!self.has_work_in_progress);
        self.has_blocked_work = false;
        self.has_work_in_progress = true;

        let batch = Arc::new(std::mem::take(&mut self.blocked_changesets));
        self.in_flight_changesets = Some(Arc::clone(&batch));
        let unblocked = self.blocked_bytes;
        self.unblocked_bytes += unblocked;
        self.blocked_bytes = 0;

        let slots = self
            .file_ident_requests
            .iter()
            .map(|(&request_ident, request)| FileIdentAllocSlot {
                request_ident,
                proxy_file: request.proxy_file,
                client_type: request.client_type,
                ident: syncd_core::SaltedFileIdent::default(),
            })
            .collect();

        let request_compaction = std::mem::take(&mut self.request_compaction);
        let request_deletion = std::mem::take(&mut self.request_deletion);
        WorkUnit {
            file_ident_alloc_slots: slots,
            changesets_from_downstream: batch,
            unblocked_bytes: unblocked,
            request_compaction,
            request_deletion,
            version_info: VersionInfo::default(),
            produced_new_realm_version: false,
            produced_new_sync_version: false,
            integration_result: syncd_core::ports::history::IntegrationResult::default(),
            integration_time: std::time::Duration::ZERO,
        }
    }

    /// All session handles currently attached, identified or not.
    pub fn all_session_handles(&self) -> Vec<SessionHandle> {
        self.unidentified_sessions
            .values()
            .chain(self.identified_sessions.values())
            .cloned()
            .collect()
    }
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}
