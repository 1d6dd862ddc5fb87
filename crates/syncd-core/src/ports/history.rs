//! The history store port.
//!
//! One [`HistoryStore`] instance manages the sync history of one realm
//! file. The server core owns exactly one per file coordinator and drives
//! all writes through the integration worker thread; implementations only
//! need interior synchronization for the concurrent read paths
//! (`bootstrap_client_session`, `fetch_download_info`) documented on each
//! method.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::cursor::{
    DownloadCursor, FileIdent, SaltedFileIdent, SaltedVersion, Timestamp, UploadCursor, Version,
};
use crate::protocol::messages::HistoryEntry;

/// Latest snapshot/version pair advertised by a history store.
///
/// `realm_version` advances on every write transaction (including ident
/// allocation); `sync_version` advances only when new downloadable history
/// was produced, and is what download scans converge towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub realm_version: Version,
    pub sync_version: SaltedVersion,
}

/// Kind of client-side file an identifier is allocated for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClientType {
    /// An ordinary end-client file.
    #[default]
    Regular,
    /// A star-topology second-tier server file.
    Subserver,
}

/// Rejection reasons for [`HistoryStore::bootstrap_client_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("client file has expired from the history")]
    ClientFileExpired,
    #[error("unknown client file identifier")]
    BadClientFileIdent,
    #[error("client file identifier salt mismatch")]
    BadClientFileIdentSalt,
    #[error("download progress server version out of range")]
    BadDownloadServerVersion,
    #[error("download progress client version inconsistent with history")]
    BadDownloadClientVersion,
    #[error("latest server version out of range")]
    BadServerVersion,
    #[error("server version salt mismatch")]
    BadServerVersionSalt,
    #[error("client type does not match the allocation")]
    BadClientType,
}

/// Authoritative resume state computed by a successful bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSessionBootstrap {
    /// Upload progress recorded in the server-side history.
    pub upload_progress: UploadCursor,
    /// Recorded lock position for the client file.
    pub locked_server_version: Version,
}

/// Why a client file was excluded from an integration batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrationError {
    #[error("changeset refers to an unknown origin file identifier")]
    BadOriginFileIdent,
    #[error("changeset could not be parsed or applied")]
    BadChangeset,
    #[error("client file has expired from the history")]
    ClientFileExpired,
}

/// One slot of a file-identifier allocation request.
///
/// The coordinator fills `request_ident`, `proxy_file`, and `client_type`;
/// the store fills `ident` during `allocate_file_identifiers`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileIdentAllocSlot {
    pub request_ident: crate::protocol::cursor::RequestIdent,
    /// For subserver allocations, the subserver file the new ident hangs
    /// off; `None` for direct clients.
    pub proxy_file: Option<FileIdent>,
    pub client_type: ClientType,
    /// Output: the allocated identifier.
    pub ident: SaltedFileIdent,
}

/// Changesets from one client file, queued for integration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegratableChangesetList {
    /// Highest upload progress reported alongside these changesets.
    pub upload_progress: UploadCursor,
    /// Highest lock position reported alongside these changesets.
    pub locked_server_version: Version,
    pub changesets: Vec<crate::protocol::messages::UploadChangeset>,
}

impl IntegratableChangesetList {
    pub fn byte_size(&self) -> u64 {
        self.changesets.iter().map(|uc| uc.data.len() as u64).sum()
    }
}

/// A full integration batch, keyed by client file identifier.
pub type IntegratableChangesets = BTreeMap<FileIdent, IntegratableChangesetList>;

/// Outcome detail of one integration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationResult {
    /// Number of changesets actually integrated.
    pub num_integrated_changesets: u64,
    /// Client files whose changesets were rejected wholesale, with the
    /// reason. The remaining files in the batch were integrated normally.
    pub excluded_client_files: BTreeMap<FileIdent, IntegrationError>,
}

/// Result of [`HistoryStore::integrate_client_changesets`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationOutcome {
    /// True when a new realm version was produced.
    pub produced_new_realm_version: bool,
    /// True when new downloadable history was produced.
    pub produced_new_sync_version: bool,
    /// Version info after the pass.
    pub version_info: VersionInfo,
    /// True when the store recommends backing up the whole realm rather
    /// than shipping an incremental backup.
    pub backup_whole_realm: bool,
    pub result: IntegrationResult,
}

/// Progress metadata returned by a download scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadInfo {
    /// The scanned client file's authoritative upload progress.
    pub upload_progress: UploadCursor,
    /// History bytes at the scan position.
    pub cumulative_bytes_current: u64,
    /// History bytes at the end of the history.
    pub cumulative_bytes_total: u64,
}

/// Inputs for in-place history compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionControl {
    /// Last time each client file was seen, from the file coordinator.
    pub last_client_accesses: BTreeMap<FileIdent, Timestamp>,
    /// Expire client files not seen within this duration. `None` disables
    /// TTL-based expiry; compaction then only trims below locked versions.
    pub history_ttl: Option<Duration>,
    /// Current time, supplied by the caller for determinism.
    pub now: Timestamp,
}

/// Space reclaimed by a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub entries_trimmed: u64,
    pub bytes_reclaimed: u64,
    pub clients_expired: u64,
}

/// Store failure unrelated to any particular client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("realm file is corrupt: {0}")]
    Corrupt(String),
    #[error("history store is closed")]
    Closed,
}

/// Handle to the sync history of one realm file.
pub trait HistoryStore: Send + Sync {
    /// Current version info.
    ///
    /// Callable from any thread at any time.
    fn get_status(&self) -> Result<VersionInfo, StoreError>;

    /// Validate an IDENT message and compute the authoritative resume
    /// state for the joining session.
    ///
    /// Read-only; callable concurrently with an in-flight integration.
    fn bootstrap_client_session(
        &self,
        client_file_ident: SaltedFileIdent,
        download_progress: DownloadCursor,
        latest_server_version: SaltedVersion,
        client_type: ClientType,
    ) -> Result<ClientSessionBootstrap, BootstrapError>;

    /// Integrate a batch of client changesets into the history.
    ///
    /// Must only be called from the integration worker, one call at a
    /// time per store. The batch is borrowed immutably: the coordinator
    /// keeps reading it for concurrent bootstraps while the call runs.
    fn integrate_client_changesets(
        &self,
        batch: &IntegratableChangesets,
    ) -> Result<IntegrationOutcome, StoreError>;

    /// Allocate one identifier per slot, filling `slot.ident`.
    ///
    /// Worker-only. Allocation is not cancellable; an identifier whose
    /// requester went away is simply never handed out again and never
    /// recycled.
    fn allocate_file_identifiers(
        &self,
        slots: &mut [FileIdentAllocSlot],
        version_info: &mut VersionInfo,
    ) -> Result<(), StoreError>;

    /// Scan a bounded, contiguous run of history for one client file.
    ///
    /// Entries in `(download_progress.server_version, end_version]` not
    /// originated by `client_file_ident` are passed to `handler` until
    /// `max_size` body bytes have accumulated; `download_progress` is
    /// advanced to the position after the last delivered entry. Returns
    /// `Ok(None)` when the client file expired mid-call.
    fn fetch_download_info(
        &self,
        client_file_ident: FileIdent,
        download_progress: &mut DownloadCursor,
        end_version: Version,
        max_size: usize,
        handler: &mut dyn FnMut(&HistoryEntry),
    ) -> Result<Option<DownloadInfo>, StoreError>;

    /// Compact the history: expire idle client files per `control`, trim
    /// entries below the minimum locked version, vacuum and persist the
    /// realm file. Requires exclusive access to the handle; no writer may
    /// run concurrently. Pair with [`reopen_after_compaction`].
    ///
    /// [`reopen_after_compaction`]: Self::reopen_after_compaction
    fn compact(&self, control: &CompactionControl) -> Result<CompactStats, StoreError>;

    /// Re-establish the in-memory handle from the vacuumed realm file
    /// after a [`compact`](Self::compact) pass. Also reopens a store that
    /// was closed.
    fn reopen_after_compaction(&self) -> Result<(), StoreError>;

    /// Flush and close the store ahead of file deletion. Subsequent calls
    /// fail with [`StoreError::Closed`].
    fn close_for_deletion(&self);
}

/// Opens history stores for realm files.
pub trait HistoryFactory: Send + Sync {
    /// Open (or create) the store backing `real_path`.
    fn open(&self, real_path: &Path) -> Result<Arc<dyn HistoryStore>, StoreError>;
}
