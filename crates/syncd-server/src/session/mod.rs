//! The per-binding protocol state machine.
//!
//! One [`Session`] represents one BIND on one connection. Its protocol
//! state is implicit in a handful of flags:
//!
//! | State            | Condition                                              |
//! |------------------|--------------------------------------------------------|
//! | AllocatingIdent  | bound, `file_ident_request != 0`                       |
//! | SendIdent        | bound, `send_ident_message`                            |
//! | WaitForIdent     | bound, `client_file_ident == 0`, neither of the above  |
//! | WaitForUnbind    | bound, `client_file_ident != 0`                        |
//! | SendError        | `error` set, ERROR frame not yet sent                  |
//! | WaitForUnbindErr | `error` set, ERROR frame sent                          |
//! | SendUnbound      | `unbind_message_received`                              |
//!
//! Handlers validate first and side-effect last; session-level failures
//! set the error flag and surface as one ERROR frame, connection-level
//! failures are returned to the connection, which soft-closes.

pub mod handle;

use std::sync::Arc;

use tracing::{debug, warn};

use syncd_core::ports::history::ClientType;
use syncd_core::protocol::messages::{DownloadBody, ServerMessage, UploadChangeset};
use syncd_core::protocol::wire;
use syncd_core::{
    DownloadCursor, FileIdent, ProtocolError, RequestIdent, Salt, SaltedFileIdent, SaltedVersion,
    SessionIdent, UploadCursor, Version, VirtualPath,
};

use crate::file::{DownloadCache, IdentifyOutcome, ServerFile};
use crate::server::SyncServer;
use handle::{ConnId, SessionHandle, SessionSignal};

/// What a session produced for one send turn.
#[derive(Default)]
pub struct SendOutcome {
    pub message: Option<ServerMessage>,
    /// More frames remain; put the session back on the queue.
    pub reenlist: bool,
    /// The session is finished and must be dropped by the connection.
    pub destroy: bool,
}

/// One session of a sync connection.
pub struct Session {
    conn_id: ConnId,
    session_ident: SessionIdent,

    server_file: Option<Arc<ServerFile>>,
    virtual_path: Option<VirtualPath>,
    client_type: ClientType,

    client_file_ident: FileIdent,
    /// Nonzero while an allocation request is outstanding.
    file_ident_request: RequestIdent,
    /// Staged outgoing identifier, valid while `send_ident_message`.
    allocated_file_ident: SaltedFileIdent,
    send_ident_message: bool,

    download_progress: DownloadCursor,
    upload_progress: UploadCursor,
    /// Fixed at IDENT; changesets at or below it were integrated before.
    upload_threshold: UploadCursor,
    locked_server_version: Version,
    /// Pending MARK: request ident and the sync version to catch up to.
    download_completion_request: Option<(RequestIdent, Version)>,

    error: Option<ProtocolError>,
    error_message_sent: bool,
    unbind_message_received: bool,
    one_download_message_sent: bool,

    /// Set by handlers/signals when the session wants a send turn;
    /// consumed by the connection.
    enlist_pending: bool,
}

impl Session {
    pub fn new(conn_id: ConnId, session_ident: SessionIdent) -> Self {
        Self {
            conn_id,
            session_ident,
            server_file: None,
            virtual_path: None,
            client_type: ClientType::Regular,
            client_file_ident: 0,
            file_ident_request: 0,
            allocated_file_ident: SaltedFileIdent::default(),
            send_ident_message: false,
            download_progress: DownloadCursor::default(),
            upload_progress: UploadCursor::default(),
            upload_threshold: UploadCursor::default(),
            locked_server_version: 0,
            download_completion_request: None,
            error: None,
            error_message_sent: false,
            unbind_message_received: false,
            one_download_message_sent: false,
            enlist_pending: false,
        }
    }

    pub const fn session_ident(&self) -> SessionIdent {
        self.session_ident
    }

    /// Consume the pending enlistment request.
    pub fn take_enlist_request(&mut self) -> bool {
        std::mem::take(&mut self.enlist_pending)
    }

    const fn in_error(&self) -> bool {
        self.error.is_some()
    }

    const fn is_wait_for_ident(&self) -> bool {
        self.server_file.is_some()
            && self.client_file_ident == 0
            && self.file_ident_request == 0
            && !self.send_ident_message
            && !self.in_error()
            && !self.unbind_message_received
    }

    const fn is_wait_for_unbind(&self) -> bool {
        self.server_file.is_some()
            && self.client_file_ident != 0
            && !self.in_error()
            && !self.unbind_message_received
    }

    // ── Incoming messages ───────────────────────────────────────────────────

    /// Handle BIND. The session was just created by the connection; a
    /// connection-level error is returned, session-level errors are
    /// staged on the session itself.
    pub fn handle_bind(
        &mut self,
        server: &Arc<SyncServer>,
        handle: SessionHandle,
        path: &str,
        signed_user_token: &str,
        need_client_file_ident: bool,
        is_subserver: bool,
    ) -> Result<(), ProtocolError> {
        let virtual_path = match VirtualPath::parse(path) {
            Ok(virtual_path) => virtual_path,
            Err(err) => {
                debug!(session = self.session_ident, path, error = %err, "rejected realm path");
                self.initiate_error(ProtocolError::IllegalRealmPath);
                return Ok(());
            }
        };

        let principal = match server.access().verify_token(signed_user_token) {
            Ok(principal) => principal,
            Err(err) => {
                debug!(session = self.session_ident, error = %err, "token rejected");
                self.initiate_error(ProtocolError::BadAuthentication);
                return Ok(());
            }
        };
        let op = syncd_core::ports::access::AccessOp::Bind;
        if !server.access().can(&principal, op, Some(&virtual_path)) {
            self.initiate_error(ProtocolError::PermissionDenied);
            return Ok(());
        }

        let file = match server.get_or_create_file(&virtual_path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %virtual_path, error = %err, "failed to open realm file");
                // Transient server-side trouble; have the client retry.
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        if file.is_deletion_ongoing() {
            self.initiate_error(ProtocolError::ServerFileDeleted);
            return Ok(());
        }

        self.client_type = if is_subserver {
            ClientType::Subserver
        } else {
            ClientType::Regular
        };
        file.add_unidentified_session(handle.clone());
        if need_client_file_ident {
            let receiver_handle = handle;
            self.file_ident_request = file.request_file_ident(
                Box::new(move |ident| {
                    receiver_handle.signal(SessionSignal::IdentAllocated(ident));
                }),
                None,
                self.client_type,
            );
        }
        self.server_file = Some(file);
        self.virtual_path = Some(virtual_path);
        Ok(())
    }

    /// Handle IDENT: validate the cursors against the history, bind the
    /// client file, and schedule the first DOWNLOAD.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_ident(
        &mut self,
        server: &Arc<SyncServer>,
        handle: &SessionHandle,
        client_file_ident: FileIdent,
        client_file_ident_salt: Salt,
        scan_server_version: Version,
        scan_client_version: Version,
        latest_server_version: Version,
        latest_server_version_salt: Salt,
    ) -> Result<(), ProtocolError> {
        if self.in_error() {
            return Ok(());
        }
        if !self.is_wait_for_ident() {
            return Err(ProtocolError::BadMessageOrder);
        }
        let Some(file) = self.server_file.clone() else {
            return Err(ProtocolError::BadMessageOrder);
        };

        let virtual_path = self.virtual_path.as_ref().map(VirtualPath::as_str);
        let blacklisted = virtual_path.is_some_and(|path| {
            server
                .config()
                .blacklist_for(path)
                .contains(&client_file_ident)
        });
        if blacklisted {
            self.initiate_error(ProtocolError::ClientFileBlacklisted);
            return Ok(());
        }

        let bootstrap = match file.bootstrap_client_session(
            SaltedFileIdent::new(client_file_ident, client_file_ident_salt),
            DownloadCursor::new(scan_server_version, scan_client_version),
            SaltedVersion::new(latest_server_version, latest_server_version_salt),
            self.client_type,
        ) {
            Ok(bootstrap) => bootstrap,
            Err(err) => {
                debug!(
                    session = self.session_ident,
                    client_file_ident,
                    error = %err,
                    "bootstrap rejected"
                );
                self.initiate_error(ProtocolError::from(err));
                return Ok(());
            }
        };

        match file.identify_session(handle, client_file_ident) {
            IdentifyOutcome::BoundInSameConnection => {
                self.initiate_error(ProtocolError::BoundInOtherSession);
                return Ok(());
            }
            IdentifyOutcome::Identified | IdentifyOutcome::TookOverZombie => {}
        }

        self.client_file_ident = client_file_ident;
        self.download_progress = DownloadCursor::new(scan_server_version, scan_client_version);
        self.upload_progress = bootstrap.upload_progress;
        self.upload_threshold = bootstrap.upload_progress;
        self.locked_server_version = bootstrap.locked_server_version;
        file.register_client_access(client_file_ident);
        // Every session announces server progress at least once.
        self.enlist_pending = true;
        Ok(())
    }

    /// Handle UPLOAD: the seven validation predicates, then hand the not
    /// previously integrated changesets to the coordinator.
    pub fn handle_upload(
        &mut self,
        progress_client_version: Version,
        progress_server_version: Version,
        locked_server_version: Version,
        changesets: Vec<UploadChangeset>,
    ) -> Result<(), ProtocolError> {
        if self.in_error() {
            return Ok(());
        }
        if !self.is_wait_for_unbind() {
            return Err(ProtocolError::BadMessageOrder);
        }
        let Some(file) = self.server_file.clone() else {
            return Err(ProtocolError::BadMessageOrder);
        };

        let progress = UploadCursor::new(progress_client_version, progress_server_version);

        // 1. Client-side progress never regresses.
        if progress_client_version < self.upload_progress.client_version {
            self.initiate_error(ProtocolError::BadClientVersion);
            return Ok(());
        }
        // 2. Claimed integration cannot be ahead of what was downloaded.
        if progress_server_version > self.download_progress.server_version {
            self.initiate_error(ProtocolError::BadServerVersion);
            return Ok(());
        }
        // 3. Reported progress is consistent with itself and the past.
        if !progress.is_consistent()
            || !progress.is_consistent_with(&self.upload_threshold)
            || !progress.is_consistent_with(&self.upload_progress)
        {
            self.initiate_error(ProtocolError::BadClientVersion);
            return Ok(());
        }
        // 4. Changesets arrive in strictly increasing client version with
        //    consistent cursors.
        let mut previous = self.upload_threshold;
        let mut last_client_version = 0;
        for uc in &changesets {
            if uc.upload_cursor.client_version <= last_client_version {
                self.initiate_error(ProtocolError::BadClientVersion);
                return Ok(());
            }
            if !uc.upload_cursor.is_consistent()
                || !uc.upload_cursor.is_consistent_with(&self.upload_threshold)
                || !uc.upload_cursor.is_consistent_with(&previous)
            {
                self.initiate_error(ProtocolError::BadClientVersion);
                return Ok(());
            }
            if uc.upload_cursor.last_integrated_server_version > progress_server_version {
                self.initiate_error(ProtocolError::BadServerVersion);
                return Ok(());
            }
            last_client_version = uc.upload_cursor.client_version;
            previous = uc.upload_cursor;
        }
        // 5. Reported progress covers every carried changeset.
        if last_client_version > progress_client_version {
            self.initiate_error(ProtocolError::BadClientVersion);
            return Ok(());
        }
        // 6. The lock position only moves forward, bounded by downloads.
        if locked_server_version < self.locked_server_version
            || locked_server_version > self.download_progress.server_version
        {
            self.initiate_error(ProtocolError::BadServerVersion);
            return Ok(());
        }
        // 7. Backpressure: refuse the whole message and make the client
        //    reconnect later.
        if !file.can_add_changesets_from_downstream() {
            debug!(
                session = self.session_ident,
                client_file_ident = self.client_file_ident,
                "upload backlog full; closing session"
            );
            self.initiate_error(ProtocolError::ConnectionClosed);
            return Ok(());
        }

        self.upload_progress.raise_to(&progress);
        self.locked_server_version = locked_server_version;

        // Changesets at or below the threshold were integrated in an
        // earlier session of this client file.
        let threshold = self.upload_threshold.client_version;
        let fresh: Vec<UploadChangeset> = changesets
            .into_iter()
            .filter(|uc| uc.upload_cursor.client_version > threshold)
            .collect();

        file.register_client_access(self.client_file_ident);
        file.add_changesets_from_downstream(
            self.client_file_ident,
            self.upload_progress,
            locked_server_version,
            fresh,
        );
        Ok(())
    }

    /// Handle MARK: remember the request and the sync version to catch up
    /// to; the MARK response is emitted once the scan reaches it.
    pub fn handle_mark(&mut self, request_ident: RequestIdent) -> Result<(), ProtocolError> {
        if self.in_error() {
            return Ok(());
        }
        if !self.is_wait_for_unbind() {
            return Err(ProtocolError::BadMessageOrder);
        }
        let target = self
            .server_file
            .as_ref()
            .map_or(0, |file| file.version_info().sync_version.version);
        self.download_completion_request = Some((request_ident, target));
        self.enlist_pending = true;
        Ok(())
    }

    /// Handle UNBIND. Returns true when the session must be destroyed
    /// immediately (its ERROR frame was already flushed).
    pub fn handle_unbind(&mut self) -> bool {
        self.unbind_message_received = true;
        self.detach();
        if self.error_message_sent {
            return true;
        }
        self.enlist_pending = true;
        false
    }

    // ── Signals from the coordinator ────────────────────────────────────────

    pub fn apply_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Resume => {
                if self.is_wait_for_unbind() {
                    self.enlist_pending = true;
                }
            }
            SessionSignal::IdentAllocated(ident) => {
                if self.in_error() || self.unbind_message_received {
                    return;
                }
                self.allocated_file_ident = ident;
                self.file_ident_request = 0;
                self.send_ident_message = true;
                self.enlist_pending = true;
            }
            SessionSignal::Error(err) => self.initiate_error(err),
        }
    }

    /// Enter the error path: detach from the coordinator and stage one
    /// ERROR frame. Later errors are ignored; the first one wins.
    fn initiate_error(&mut self, err: ProtocolError) {
        if self.in_error() {
            return;
        }
        debug!(session = self.session_ident, error = %err, code = err.code(), "session error");
        self.error = Some(err);
        self.detach();
        self.enlist_pending = true;
    }

    /// Remove this session from its coordinator. Idempotent; called from
    /// the error path, UNBIND, and connection teardown.
    pub fn detach(&mut self) {
        if let Some(file) = self.server_file.take() {
            if self.file_ident_request != 0 {
                file.cancel_file_ident_request(self.file_ident_request);
                self.file_ident_request = 0;
            }
            if self.client_file_ident != 0 {
                file.remove_identified_session(
                    self.client_file_ident,
                    self.conn_id,
                    self.session_ident,
                );
            } else {
                file.remove_unidentified_session(self.conn_id, self.session_ident);
            }
        }
    }

    // ── Outgoing scheduling ─────────────────────────────────────────────────

    /// Produce at most one outgoing frame for this turn.
    pub fn produce_frame(&mut self) -> SendOutcome {
        if let Some(err) = self.error {
            if !self.error_message_sent && !self.unbind_message_received {
                self.error_message_sent = true;
                return SendOutcome {
                    message: Some(ServerMessage::Error {
                        session_ident: self.session_ident,
                        error_code: err.code(),
                        message: err.to_string(),
                        try_again: err.try_again(),
                    }),
                    reenlist: false,
                    destroy: false,
                };
            }
        }

        if self.unbind_message_received {
            return SendOutcome {
                message: Some(ServerMessage::Unbound {
                    session_ident: self.session_ident,
                }),
                reenlist: false,
                destroy: true,
            };
        }

        if self.in_error() {
            // WaitForUnbindErr: nothing to say until UNBIND arrives.
            return SendOutcome::default();
        }

        if self.send_ident_message {
            self.send_ident_message = false;
            return SendOutcome {
                message: Some(ServerMessage::Ident {
                    session_ident: self.session_ident,
                    client_file_ident: self.allocated_file_ident,
                }),
                reenlist: false,
                destroy: false,
            };
        }

        if self.client_file_ident != 0 {
            return self.continue_history_scan();
        }

        SendOutcome::default()
    }

    /// Emit at most one DOWNLOAD (or a caught-up MARK) per turn.
    fn continue_history_scan(&mut self) -> SendOutcome {
        let Some(file) = self.server_file.clone() else {
            return SendOutcome::default();
        };
        let config = file.config();
        let end = file.version_info().sync_version;

        let need_download =
            !self.one_download_message_sent || self.download_progress.server_version < end.version;
        if need_download {
            // Fresh clients share one cached body per end version.
            let fresh_client = self.download_progress.server_version == 0
                && self.upload_progress.client_version == 0
                && self.upload_threshold.client_version == 0;
            if fresh_client {
                if let Some(cache) = file.cached_download(end.version) {
                    let upload_progress = self.upload_progress;
                    return self.emit_download(end, cache, upload_progress);
                }
                // Bound memory: drop the stale body before building the
                // replacement.
                file.discard_stale_download(end.version);
            }

            let mut entries = Vec::new();
            let mut progress = self.download_progress;
            let fetched = file.history().fetch_download_info(
                self.client_file_ident,
                &mut progress,
                end.version,
                config.effective_max_download_size(),
                &mut |entry| entries.push(entry.clone()),
            );
            let info = match fetched {
                Ok(Some(info)) => info,
                Ok(None) => {
                    self.initiate_error(ProtocolError::ClientFileExpired);
                    return SendOutcome {
                        message: None,
                        reenlist: true,
                        destroy: false,
                    };
                }
                Err(err) => {
                    warn!(session = self.session_ident, error = %err, "history scan failed");
                    return SendOutcome::default();
                }
            };

            let raw = wire::encode_history_entries(&entries);
            let uncompressed_size = raw.len();
            let (is_compressed, bytes) =
                wire::compress_if_profitable(raw, config.effective_compression_threshold());
            let cache = DownloadCache {
                end_version: end.version,
                progress,
                num_changesets: entries.len() as u64,
                downloadable_bytes: info
                    .cumulative_bytes_total
                    .saturating_sub(info.cumulative_bytes_current),
                body: DownloadBody {
                    is_compressed,
                    uncompressed_size,
                    bytes,
                },
            };
            if fresh_client {
                file.store_download_cache(cache.clone());
            }
            return self.emit_download(end, cache, info.upload_progress);
        }

        if let Some((request_ident, target)) = self.download_completion_request {
            if self.download_progress.server_version >= target {
                self.download_completion_request = None;
                return SendOutcome {
                    message: Some(ServerMessage::Mark {
                        session_ident: self.session_ident,
                        request_ident,
                    }),
                    reenlist: false,
                    destroy: false,
                };
            }
        }

        SendOutcome::default()
    }

    fn emit_download(
        &mut self,
        end: SaltedVersion,
        cache: DownloadCache,
        upload_progress: UploadCursor,
    ) -> SendOutcome {
        self.download_progress = cache.progress;
        self.one_download_message_sent = true;
        let more = self.download_progress.server_version < end.version;
        let mark_ready = self
            .download_completion_request
            .is_some_and(|(_, target)| self.download_progress.server_version >= target);
        SendOutcome {
            message: Some(ServerMessage::Download {
                session_ident: self.session_ident,
                progress: cache.progress,
                end,
                upload_progress,
                downloadable_bytes: cache.downloadable_bytes,
                num_changesets: cache.num_changesets,
                body: cache.body,
            }),
            reenlist: more || mark_ready,
            destroy: false,
        }
    }
}
