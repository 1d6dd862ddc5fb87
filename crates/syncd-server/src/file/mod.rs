//! The per-realm-file coordinator.
//!
//! One [`ServerFile`] exists per open realm file and serializes all writes
//! and all version-related decisions for it. The only writer of the file's
//! history is the integration worker thread, and only while the
//! coordinator has handed a work unit off to it; the hand-off token is the
//! `has_work_in_progress` flag inside [`CoordinatorState`].
//!
//! Public operations are called from connection tasks; the `run_work_cycle`
//! path is called from the worker thread. Every critical section is short
//! and never awaits.

pub mod state;
pub mod work;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use syncd_core::ports::history::{
    BootstrapError, ClientSessionBootstrap, ClientType, CompactionControl, HistoryStore,
    VersionInfo,
};
use syncd_core::ports::metrics::{names, MetricsSink};
use syncd_core::protocol::cursor::Timestamp;
use syncd_core::protocol::messages::UploadChangeset;
use syncd_core::{
    DownloadCursor, FileIdent, ProtocolError, RequestIdent, SaltedFileIdent, SaltedVersion,
    ServerConfig, SessionIdent, UploadCursor, Version, VirtualPath,
};

use crate::server::SyncServer;
use crate::session::handle::{ConnId, SessionHandle, SessionSignal};
use crate::worker::WorkerState;

pub use state::{CoordinatorState, DownloadCache, IdentReceiver, IdentRequest};
pub use work::WorkUnit;

fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Result of binding a client file to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// The session is now the sole binding for the client file.
    Identified,
    /// Another session on the *same* connection already holds the client
    /// file; the caller reports `bound_in_other_session`.
    BoundInSameConnection,
    /// A session on a different connection held the client file; that
    /// connection was terminated as a zombie and the binding taken over.
    TookOverZombie,
}

/// Coordinator for one realm file.
pub struct ServerFile {
    virtual_path: VirtualPath,
    real_path: PathBuf,
    lock_path: PathBuf,
    root_dir: PathBuf,
    history: Arc<dyn HistoryStore>,
    server: Weak<SyncServer>,
    config: Arc<ServerConfig>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<CoordinatorState>,
    /// The in-flight unit, present between hand-off and pick-up.
    work_slot: Mutex<Option<WorkUnit>>,
}

impl ServerFile {
    pub fn new(
        virtual_path: VirtualPath,
        root_dir: PathBuf,
        history: Arc<dyn HistoryStore>,
        server: Weak<SyncServer>,
        config: Arc<ServerConfig>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let real_path = virtual_path.real_path(&root_dir);
        let lock_path = virtual_path.lock_path(&root_dir);
        Self {
            virtual_path,
            real_path,
            lock_path,
            root_dir,
            history,
            server,
            config,
            metrics,
            state: Mutex::new(CoordinatorState::new()),
            work_slot: Mutex::new(None),
        }
    }

    /// Read the initial version info from the history store. Called once
    /// by the server root right after construction.
    pub fn activate(&self) -> Result<(), syncd_core::ports::history::StoreError> {
        let info = self.history.get_status()?;
        self.lock_state().version_info = info;
        debug!(path = %self.virtual_path, sync_version = info.sync_version.version, "realm file activated");
        Ok(())
    }

    pub fn virtual_path(&self) -> &VirtualPath {
        &self.virtual_path
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The latest snapshot advertised to clients.
    pub fn version_info(&self) -> VersionInfo {
        self.lock_state().version_info
    }

    pub fn is_deletion_ongoing(&self) -> bool {
        self.lock_state().deletion_is_ongoing
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Session attachment ──────────────────────────────────────────────────

    /// Attach a session that has sent BIND but not yet IDENT.
    pub fn add_unidentified_session(&self, handle: SessionHandle) {
        let mut st = self.lock_state();
        st.unidentified_sessions
            .insert((handle.conn_id(), handle.session_ident()), handle);
    }

    pub fn remove_unidentified_session(&self, conn_id: ConnId, session_ident: SessionIdent) {
        let mut st = self.lock_state();
        st.unidentified_sessions.remove(&(conn_id, session_ident));
    }

    /// Move a session from unidentified to identified under `ident`.
    pub fn identify_session(&self, handle: &SessionHandle, ident: FileIdent) -> IdentifyOutcome {
        let mut st = self.lock_state();
        let mut outcome = IdentifyOutcome::Identified;
        if let Some(existing) = st.identified_sessions.get(&ident) {
            if existing.conn_id() == handle.conn_id() {
                return IdentifyOutcome::BoundInSameConnection;
            }
            // The peer bound this client file from a new connection; the
            // old one is presumed dead and torn down without ceremony.
            info!(
                path = %self.virtual_path,
                client_file_ident = ident,
                old_conn = existing.conn_id(),
                new_conn = handle.conn_id(),
                "client file rebound from new connection; terminating zombie"
            );
            existing.terminate_connection();
            outcome = IdentifyOutcome::TookOverZombie;
        }
        st.unidentified_sessions
            .remove(&(handle.conn_id(), handle.session_ident()));
        st.identified_sessions.insert(ident, handle.clone());
        outcome
    }

    /// Detach an identified session, but only if `conn_id`/`session_ident`
    /// still own the binding (a zombie takeover may have replaced it).
    pub fn remove_identified_session(
        &self,
        ident: FileIdent,
        conn_id: ConnId,
        session_ident: SessionIdent,
    ) {
        let mut st = self.lock_state();
        let owned = st
            .identified_sessions
            .get(&ident)
            .is_some_and(|handle| handle.same_session(conn_id, session_ident));
        if owned {
            st.identified_sessions.remove(&ident);
        }
    }

    // ── File ident allocation ───────────────────────────────────────────────

    /// Queue an allocation request. The receiver is invoked during
    /// post-processing of the work unit that allocates the identifier, in
    /// request order.
    pub fn request_file_ident(
        self: &Arc<Self>,
        receiver: IdentReceiver,
        proxy_file: Option<FileIdent>,
        client_type: ClientType,
    ) -> RequestIdent {
        let ident = {
            let mut st = self.lock_state();
            st.add_ident_request(IdentRequest {
                receiver: Some(receiver),
                proxy_file,
                client_type,
            })
        };
        self.on_work_added();
        ident
    }

    /// Cancel a pending request. The allocation itself is not cancellable;
    /// an identifier already produced is silently dropped and never
    /// recycled by the server.
    pub fn cancel_file_ident_request(&self, ident: RequestIdent) {
        self.lock_state().cancel_ident_request(ident);
    }

    // ── Upload intake ───────────────────────────────────────────────────────

    /// The sole backpressure knob: false once the blocked side holds at
    /// least `max_upload_backlog` bytes.
    pub fn can_add_changesets_from_downstream(&self) -> bool {
        self.lock_state().blocked_bytes < self.config.effective_max_upload_backlog()
    }

    /// Queue validated inbound changesets for integration.
    pub fn add_changesets_from_downstream(
        self: &Arc<Self>,
        client_file_ident: FileIdent,
        upload_progress: UploadCursor,
        locked_server_version: Version,
        changesets: Vec<UploadChangeset>,
    ) {
        let bytes = {
            let mut st = self.lock_state();
            st.queue_changesets(
                client_file_ident,
                upload_progress,
                locked_server_version,
                changesets,
            )
        };
        if bytes > 0 {
            self.metrics
                .gauge_add(names::PENDING_UPLOAD_BYTES, bytes as f64);
        }
        self.on_work_added();
    }

    /// Validate an IDENT message against the history store, then adjust
    /// the resume state for any blocked or in-flight data the server
    /// already holds for this client file.
    pub fn bootstrap_client_session(
        &self,
        client_file_ident: SaltedFileIdent,
        download_progress: DownloadCursor,
        latest_server_version: SaltedVersion,
        client_type: ClientType,
    ) -> Result<ClientSessionBootstrap, BootstrapError> {
        let mut bootstrap = self.history.bootstrap_client_session(
            client_file_ident,
            download_progress,
            latest_server_version,
            client_type,
        )?;

        let mut st = self.lock_state();
        if let Some(list) = st.blocked_changesets.get(&client_file_ident.ident) {
            bootstrap.upload_progress.raise_to(&list.upload_progress);
            bootstrap.locked_server_version = bootstrap
                .locked_server_version
                .max(list.locked_server_version);
        }
        if let Some(batch) = &st.in_flight_changesets {
            if let Some(list) = batch.get(&client_file_ident.ident) {
                bootstrap.upload_progress.raise_to(&list.upload_progress);
                bootstrap.locked_server_version = bootstrap
                    .locked_server_version
                    .max(list.locked_server_version);
            }
        }
        if self.config.effective_history_ttl().is_some() {
            st.last_client_accesses
                .insert(client_file_ident.ident, now_ms());
        }
        Ok(bootstrap)
    }

    /// Record that a client file touched this file. Only tracked when
    /// history TTL compaction is enabled.
    pub fn register_client_access(&self, client_file_ident: FileIdent) {
        if self.config.effective_history_ttl().is_none() {
            return;
        }
        self.lock_state()
            .last_client_accesses
            .insert(client_file_ident, now_ms());
    }

    /// Snapshot of the last-access map, read by the worker for compaction.
    pub fn get_last_client_accesses(&self) -> std::collections::BTreeMap<FileIdent, Timestamp> {
        self.lock_state().last_client_accesses.clone()
    }

    // ── Admin operations ────────────────────────────────────────────────────

    /// Request in-place history compaction. `waiter` fires when the pass
    /// completes.
    pub fn initiate_compaction(self: &Arc<Self>, waiter: Option<oneshot::Sender<()>>) {
        {
            let mut st = self.lock_state();
            st.request_compaction = true;
            if let Some(waiter) = waiter {
                st.compaction_waiters.push(waiter);
            }
        }
        self.on_work_added();
    }

    /// Request deletion of the realm file. `waiter` fires after the file
    /// and its empty parent directories are gone and the coordinator is
    /// unregistered.
    pub fn initiate_deletion(self: &Arc<Self>, waiter: Option<oneshot::Sender<()>>) {
        let mut waiter = waiter;
        let already_done = {
            let mut st = self.lock_state();
            if st.deletion_completed {
                true
            } else {
                st.request_deletion = true;
                st.deletion_is_ongoing = true;
                if let Some(waiter) = waiter.take() {
                    st.deletion_waiters.push(waiter);
                }
                false
            }
        };
        if already_done {
            if let Some(waiter) = waiter.take() {
                let _ = waiter.send(());
            }
            return;
        }
        self.on_work_added();
    }

    /// Re-read version info from the history store after an out-of-band
    /// change; on advance, every bound session resumes downloading.
    pub fn recognize_external_change(&self) {
        let info = match self.history.get_status() {
            Ok(info) => info,
            Err(err) => {
                warn!(path = %self.virtual_path, error = %err, "failed to re-read version info");
                return;
            }
        };
        let handles = {
            let mut st = self.lock_state();
            if info.sync_version.version <= st.version_info.sync_version.version {
                return;
            }
            st.version_info = info;
            st.identified_sessions.values().cloned().collect::<Vec<_>>()
        };
        for handle in handles {
            handle.signal(SessionSignal::Resume);
        }
    }

    // ── Download cache ──────────────────────────────────────────────────────

    /// Cached DOWNLOAD body for a fresh client, if it matches
    /// `end_version`.
    pub fn cached_download(&self, end_version: Version) -> Option<DownloadCache> {
        let st = self.lock_state();
        st.download_cache
            .as_ref()
            .filter(|cache| cache.end_version == end_version)
            .cloned()
    }

    /// Discard a stale cached body. Called before assembling the
    /// replacement so peak memory stays bounded to one body.
    pub fn discard_stale_download(&self, end_version: Version) {
        let mut st = self.lock_state();
        if st
            .download_cache
            .as_ref()
            .is_some_and(|cache| cache.end_version != end_version)
        {
            st.download_cache = None;
        }
    }

    pub fn store_download_cache(&self, cache: DownloadCache) {
        self.lock_state().download_cache = Some(cache);
    }

    // ── Work scheduling ─────────────────────────────────────────────────────

    /// Called whenever new work (changesets, allocation requests,
    /// compaction or deletion requests) appears. If idle, unblocks
    /// immediately; otherwise the work stays on the blocked side. The
    /// in-progress token is claimed under the same lock that inspects it,
    /// so concurrent callers cannot both unblock.
    fn on_work_added(self: &Arc<Self>) {
        let work = {
            let mut st = self.lock_state();
            if st.has_work_in_progress {
                st.has_blocked_work = true;
                None
            } else {
                Some(st.take_work())
            }
        };
        if let Some(work) = work {
            self.group_unblock_work(work);
        }
    }

    /// Hand a captured work unit off to the worker. No-op units skip the
    /// worker and finalize on the calling thread.
    fn group_unblock_work(self: &Arc<Self>, work: WorkUnit) {
        if work.is_noop() {
            self.finalize_work(work, None);
            return;
        }
        *self.work_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(work);
        if let Some(server) = self.server.upgrade() {
            server.enqueue_work(Arc::clone(self));
        }
    }

    /// Entry point for the worker thread: process the in-flight unit and
    /// finalize it. Units that requested compaction finalize on the
    /// runtime's blocking pool instead: the vacuum must not occupy the one
    /// thread every other realm file's writes are queued behind. The
    /// file's own in-progress token stays set until stage 3, so no writer
    /// runs concurrently with the vacuum.
    pub fn run_work_cycle(self: &Arc<Self>, worker: &mut WorkerState) {
        let taken = self.work_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut work) = taken else {
            return;
        };
        self.worker_process_work_unit(&mut work);
        if work.request_compaction && !work.request_deletion {
            let file = Arc::clone(self);
            let pool = Arc::clone(&worker.pool);
            worker
                .runtime
                .spawn_blocking(move || file.finalize_work(work, Some(&pool)));
            return;
        }
        self.finalize_work(work, Some(&worker.pool));
    }

    // ── Worker-side processing ──────────────────────────────────────────────

    fn worker_process_work_unit(&self, work: &mut WorkUnit) {
        if work.request_deletion {
            // Close the store; everything else happens in post-processing.
            self.history.close_for_deletion();
            return;
        }

        if !work.file_ident_alloc_slots.is_empty() {
            if let Err(err) = self
                .history
                .allocate_file_identifiers(&mut work.file_ident_alloc_slots, &mut work.version_info)
            {
                error!(path = %self.virtual_path, error = %err, "file ident allocation failed");
            }
        }

        if !work.changesets_from_downstream.is_empty() {
            let started = Instant::now();
            match self
                .history
                .integrate_client_changesets(&work.changesets_from_downstream)
            {
                Ok(outcome) => {
                    work.version_info = outcome.version_info;
                    work.produced_new_realm_version = outcome.produced_new_realm_version;
                    work.produced_new_sync_version = outcome.produced_new_sync_version;
                    work.integration_result = outcome.result;
                }
                Err(err) => {
                    error!(path = %self.virtual_path, error = %err, "changeset integration failed");
                }
            }
            work.integration_time = started.elapsed();
            self.metrics
                .timing(names::INTEGRATION_TIME, work.integration_time);
        }
    }

    // ── Post-processing ─────────────────────────────────────────────────────

    /// Finalize a work unit: stages 1-3 in order, then re-arm if work
    /// accumulated while the unit was in flight.
    fn finalize_work(self: &Arc<Self>, work: WorkUnit, pool: Option<&Arc<crate::worker::JobPool>>) {
        self.finalize_work_stage_1(&work, pool);
        self.finalize_work_stage_2(&work);
        self.finalize_work_stage_3(work);
    }

    /// Stage 1: release byte accounting, run compaction, and expel the
    /// client files that integration excluded.
    fn finalize_work_stage_1(
        self: &Arc<Self>,
        work: &WorkUnit,
        pool: Option<&Arc<crate::worker::JobPool>>,
    ) {
        if work.unblocked_bytes > 0 {
            self.metrics
                .gauge_add(names::PENDING_UPLOAD_BYTES, -(work.unblocked_bytes as f64));
            let mut st = self.lock_state();
            st.unblocked_bytes -= work.unblocked_bytes;
        }

        if work.request_compaction && !work.request_deletion {
            self.run_compaction(pool);
        }

        for (&client_file_ident, &err) in &work.integration_result.excluded_client_files {
            let (released, handle) = {
                let mut st = self.lock_state();
                let released = st.drop_blocked_entry(client_file_ident);
                (released, st.identified_sessions.get(&client_file_ident).cloned())
            };
            if released > 0 {
                self.metrics
                    .gauge_add(names::PENDING_UPLOAD_BYTES, -(released as f64));
            }
            if let Some(handle) = handle {
                handle.signal(SessionSignal::Error(ProtocolError::from(err)));
            }
        }
    }

    /// Stage 2: publish the new version, deliver allocated identifiers in
    /// request order, and fan out download resumption.
    fn finalize_work_stage_2(&self, work: &WorkUnit) {
        let mut deliveries: Vec<(IdentReceiver, SaltedFileIdent)> = Vec::new();
        let resume_handles = {
            let mut st = self.lock_state();
            if work.version_info.realm_version > st.version_info.realm_version {
                st.version_info = work.version_info;
            }
            for slot in &work.file_ident_alloc_slots {
                if let Some(request) = st.file_ident_requests.remove(&slot.request_ident) {
                    if slot.ident.ident != 0 {
                        if let Some(receiver) = request.receiver {
                            deliveries.push((receiver, slot.ident));
                        }
                    }
                }
            }
            st.in_flight_changesets = None;
            if work.produced_new_sync_version {
                st.identified_sessions.values().cloned().collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };

        for (receiver, ident) in deliveries {
            receiver(ident);
        }
        for handle in resume_handles {
            handle.signal(SessionSignal::Resume);
        }
    }

    /// Stage 3: complete deletion, or clear the in-progress token and
    /// re-arm if work accumulated during flight.
    fn finalize_work_stage_3(self: &Arc<Self>, work: WorkUnit) {
        if work.request_deletion {
            self.perform_file_deletion();
            return;
        }
        let next = {
            let mut st = self.lock_state();
            st.has_work_in_progress = false;
            if st.has_blocked_work {
                Some(st.take_work())
            } else {
                None
            }
        };
        if let Some(work) = next {
            self.group_unblock_work(work);
        }
    }

    fn run_compaction(&self, pool: Option<&Arc<crate::worker::JobPool>>) {
        let control = CompactionControl {
            last_client_accesses: self.get_last_client_accesses(),
            history_ttl: self.config.effective_history_ttl(),
            now: now_ms(),
        };
        let compact = {
            let history = Arc::clone(&self.history);
            move || {
                history
                    .compact(&control)
                    .map(|_| ())
                    .map_err(|err| crate::worker::PoolError::Job(err.to_string()))
            }
        };
        // The vacuum itself runs as an auxiliary pool sub-job.
        let outcome = match pool {
            Some(pool) => {
                pool.add_work(move |_scratch| compact());
                pool.wait_completion()
            }
            None => compact(),
        };
        match outcome {
            Ok(()) => {
                if let Err(err) = self.history.reopen_after_compaction() {
                    warn!(path = %self.virtual_path, error = %err, "failed to reopen after compaction");
                }
            }
            Err(err) => {
                warn!(path = %self.virtual_path, error = %err, "history compaction failed");
            }
        }
        let waiters = std::mem::take(&mut self.lock_state().compaction_waiters);
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Drive all bound sessions through `server_file_deleted`, delete the
    /// realm file and its now-empty ancestors, wake the admin waiters,
    /// and unregister the coordinator. The registry reference may be the
    /// last one; `self` can be dropped right after this returns.
    fn perform_file_deletion(self: &Arc<Self>) {
        let (handles, waiters) = {
            let mut st = self.lock_state();
            let handles = st.all_session_handles();
            st.unidentified_sessions.clear();
            st.identified_sessions.clear();
            st.download_cache = None;
            st.deletion_completed = true;
            (handles, std::mem::take(&mut st.deletion_waiters))
        };
        for handle in &handles {
            handle.signal(SessionSignal::Error(ProtocolError::ServerFileDeleted));
        }

        if let Err(err) = std::fs::remove_file(&self.real_path) {
            warn!(path = %self.real_path.display(), error = %err, "failed to remove realm file");
        }
        let _ = std::fs::remove_file(&self.lock_path);
        let _ = syncd_core::paths::prune_empty_parents(&self.root_dir, &self.real_path);

        if let Some(server) = self.server.upgrade() {
            server.unregister_file(&self.virtual_path);
        }
        info!(path = %self.virtual_path, sessions = handles.len(), "realm file deleted");

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}
