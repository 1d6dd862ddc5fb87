//! The store implementation.
//!
//! # Locking
//!
//! A single mutex guards the whole store. Write paths (integration,
//! allocation, compaction) only ever run on the server's integration
//! worker, one at a time; the read paths (`get_status`,
//! `bootstrap_client_session`, `fetch_download_info`) take the same lock
//! briefly from connection tasks. `None` behind the mutex means the store
//! was closed ahead of file deletion.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use syncd_core::ports::history::{
    BootstrapError, ClientSessionBootstrap, ClientType, CompactStats, CompactionControl,
    DownloadInfo, FileIdentAllocSlot, HistoryFactory, HistoryStore, IntegratableChangesets,
    IntegrationError, IntegrationOutcome, IntegrationResult, StoreError, VersionInfo,
};
use syncd_core::protocol::cursor::{
    random_salt, DownloadCursor, FileIdent, SaltedFileIdent, SaltedVersion, Timestamp,
    UploadCursor, Version,
};
use syncd_core::protocol::messages::HistoryEntry;

use crate::snapshot::{ClientFile, Snapshot, StoredEntry, SNAPSHOT_FORMAT};

fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// File-backed history store for one realm file.
pub struct FileHistoryStore {
    path: PathBuf,
    inner: Mutex<Option<Snapshot>>,
}

impl FileHistoryStore {
    /// Open the store backing `path`, creating the realm file (and its
    /// lock file) when it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let snapshot = if path.exists() {
            let bytes = std::fs::read(path)?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            if snapshot.format != SNAPSHOT_FORMAT {
                return Err(StoreError::Corrupt(format!(
                    "unsupported snapshot format {}",
                    snapshot.format
                )));
            }
            debug!(path = %path.display(), sync_version = snapshot.sync_version, "opened realm file");
            snapshot
        } else {
            let snapshot = Snapshot::new(random_salt(&mut rand::thread_rng()));
            write_snapshot(path, &snapshot)?;
            let lock_path = lock_path_for(path);
            std::fs::write(&lock_path, b"")?;
            info!(path = %path.display(), "created realm file");
            snapshot
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Some(snapshot)),
        })
    }

    fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = guard.as_mut().ok_or(StoreError::Closed)?;
        f(snapshot)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        write_snapshot(&self.path, snapshot)
    }

    fn version_info_of(snapshot: &Snapshot) -> VersionInfo {
        // Version zero carries no salt: a fresh history has no identity a
        // client could have diverged from.
        let salt = if snapshot.sync_version == 0 {
            0
        } else {
            snapshot.history_salt
        };
        VersionInfo {
            realm_version: snapshot.realm_version,
            sync_version: SaltedVersion::new(snapshot.sync_version, salt),
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".lock");
    path.with_file_name(name)
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec(snapshot).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    let tmp = path.with_extension("realm.tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl HistoryStore for FileHistoryStore {
    fn get_status(&self) -> Result<VersionInfo, StoreError> {
        self.with_snapshot(|snapshot| Ok(Self::version_info_of(snapshot)))
    }

    fn bootstrap_client_session(
        &self,
        client_file_ident: SaltedFileIdent,
        download_progress: DownloadCursor,
        latest_server_version: SaltedVersion,
        client_type: ClientType,
    ) -> Result<ClientSessionBootstrap, BootstrapError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // A closed store is being deleted; to the client that file is gone.
        let snapshot = guard.as_mut().ok_or(BootstrapError::ClientFileExpired)?;

        let entry = snapshot
            .client_files
            .get(&client_file_ident.ident)
            .ok_or(BootstrapError::BadClientFileIdent)?;
        if entry.ident_salt != client_file_ident.salt {
            return Err(BootstrapError::BadClientFileIdentSalt);
        }
        if entry.expired {
            return Err(BootstrapError::ClientFileExpired);
        }
        if entry.client_type != client_type {
            return Err(BootstrapError::BadClientType);
        }
        if latest_server_version.version > snapshot.sync_version {
            return Err(BootstrapError::BadServerVersion);
        }
        if latest_server_version.version > 0 && latest_server_version.salt != snapshot.history_salt
        {
            return Err(BootstrapError::BadServerVersionSalt);
        }
        if download_progress.server_version > snapshot.sync_version {
            return Err(BootstrapError::BadDownloadServerVersion);
        }
        if !download_progress.is_consistent()
            || download_progress.last_integrated_client_version
                > entry.upload_progress.client_version
        {
            return Err(BootstrapError::BadDownloadClientVersion);
        }

        let bootstrap = ClientSessionBootstrap {
            upload_progress: entry.upload_progress,
            locked_server_version: entry.locked_server_version,
        };
        let ident = client_file_ident.ident;
        if let Some(entry) = snapshot.client_files.get_mut(&ident) {
            entry.last_seen = now_ms();
        }
        Ok(bootstrap)
    }

    fn integrate_client_changesets(
        &self,
        batch: &IntegratableChangesets,
    ) -> Result<IntegrationOutcome, StoreError> {
        self.with_snapshot(|snapshot| {
            let mut result = IntegrationResult::default();
            let mut appended = false;
            let mut progressed = false;
            let now = now_ms();

            for (&client_file_ident, list) in batch {
                let Some(entry) = snapshot.client_files.get(&client_file_ident) else {
                    result
                        .excluded_client_files
                        .insert(client_file_ident, IntegrationError::ClientFileExpired);
                    continue;
                };
                if entry.expired {
                    result
                        .excluded_client_files
                        .insert(client_file_ident, IntegrationError::ClientFileExpired);
                    continue;
                }
                // Origin idents must denote this file or a known client file.
                let bad_origin = list.changesets.iter().any(|uc| {
                    uc.origin_file_ident != 0
                        && uc.origin_file_ident != client_file_ident
                        && !snapshot.client_files.contains_key(&uc.origin_file_ident)
                });
                if bad_origin {
                    result
                        .excluded_client_files
                        .insert(client_file_ident, IntegrationError::BadOriginFileIdent);
                    continue;
                }

                let mut progress = entry.upload_progress;
                for uc in &list.changesets {
                    // Anything at or below the recorded progress was
                    // integrated in an earlier transaction.
                    if uc.upload_cursor.client_version <= progress.client_version {
                        continue;
                    }
                    snapshot.sync_version += 1;
                    let origin = if uc.origin_file_ident == 0 {
                        client_file_ident
                    } else {
                        uc.origin_file_ident
                    };
                    snapshot.entries.push(StoredEntry {
                        server_version: snapshot.sync_version,
                        origin_file_ident: origin,
                        origin_timestamp: uc.origin_timestamp,
                        last_integrated_client_version: uc.upload_cursor.client_version,
                        data: uc.data.clone(),
                    });
                    progress.raise_to(&UploadCursor::new(
                        uc.upload_cursor.client_version,
                        uc.upload_cursor.last_integrated_server_version,
                    ));
                    result.num_integrated_changesets += 1;
                    appended = true;
                }
                progress.raise_to(&list.upload_progress);

                if let Some(entry) = snapshot.client_files.get_mut(&client_file_ident) {
                    if progress != entry.upload_progress
                        || list.locked_server_version > entry.locked_server_version
                    {
                        progressed = true;
                    }
                    entry.upload_progress = progress;
                    entry.locked_server_version = entry
                        .locked_server_version
                        .max(list.locked_server_version);
                    entry.last_seen = now;
                }
            }

            let changed = appended || progressed;
            if changed {
                snapshot.realm_version += 1;
                self.persist(snapshot)?;
            }

            Ok(IntegrationOutcome {
                produced_new_realm_version: changed,
                produced_new_sync_version: appended,
                version_info: Self::version_info_of(snapshot),
                backup_whole_realm: false,
                result,
            })
        })
    }

    fn allocate_file_identifiers(
        &self,
        slots: &mut [FileIdentAllocSlot],
        version_info: &mut VersionInfo,
    ) -> Result<(), StoreError> {
        self.with_snapshot(|snapshot| {
            if slots.is_empty() {
                *version_info = Self::version_info_of(snapshot);
                return Ok(());
            }
            let now = now_ms();
            let mut rng = rand::thread_rng();
            for slot in slots.iter_mut() {
                let ident = snapshot.next_file_ident;
                snapshot.next_file_ident += 1;
                let salt = random_salt(&mut rng);
                snapshot.client_files.insert(
                    ident,
                    ClientFile {
                        ident_salt: salt,
                        client_type: slot.client_type,
                        upload_progress: UploadCursor::default(),
                        locked_server_version: 0,
                        expired: false,
                        proxy_of: slot.proxy_file,
                        last_seen: now,
                    },
                );
                slot.ident = SaltedFileIdent::new(ident, salt);
            }
            snapshot.realm_version += 1;
            self.persist(snapshot)?;
            *version_info = Self::version_info_of(snapshot);
            debug!(count = slots.len(), "allocated client file identifiers");
            Ok(())
        })
    }

    fn fetch_download_info(
        &self,
        client_file_ident: FileIdent,
        download_progress: &mut DownloadCursor,
        end_version: Version,
        max_size: usize,
        handler: &mut dyn FnMut(&HistoryEntry),
    ) -> Result<Option<DownloadInfo>, StoreError> {
        self.with_snapshot(|snapshot| {
            let Some(client) = snapshot.client_files.get(&client_file_ident) else {
                return Ok(None);
            };
            if client.expired {
                return Ok(None);
            }

            let mut scanned_to = download_progress.server_version;
            let mut last_integrated = download_progress.last_integrated_client_version;
            let mut accumulated = 0usize;
            let mut stopped_early = false;

            for entry in &snapshot.entries {
                if entry.server_version <= download_progress.server_version {
                    continue;
                }
                if entry.server_version > end_version {
                    break;
                }
                if entry.origin_file_ident == client_file_ident {
                    // The client's own changes are never sent back; passing
                    // one advances the integration counterpart instead.
                    scanned_to = entry.server_version;
                    last_integrated = last_integrated.max(entry.last_integrated_client_version);
                    continue;
                }
                if accumulated >= max_size {
                    stopped_early = true;
                    break;
                }
                handler(&HistoryEntry {
                    server_version: entry.server_version,
                    origin_file_ident: entry.origin_file_ident,
                    origin_timestamp: entry.origin_timestamp,
                    last_integrated_client_version: last_integrated,
                    data: entry.data.clone(),
                });
                accumulated += entry.data.len();
                scanned_to = entry.server_version;
            }
            if !stopped_early {
                scanned_to = scanned_to.max(end_version.min(snapshot.sync_version));
            }

            download_progress.server_version = scanned_to;
            download_progress.last_integrated_client_version = last_integrated;

            let mut bytes_current = 0u64;
            let mut bytes_total = 0u64;
            for entry in &snapshot.entries {
                if entry.origin_file_ident == client_file_ident {
                    continue;
                }
                bytes_total += entry.data.len() as u64;
                if entry.server_version <= scanned_to {
                    bytes_current += entry.data.len() as u64;
                }
            }

            Ok(Some(DownloadInfo {
                upload_progress: client.upload_progress,
                cumulative_bytes_current: bytes_current,
                cumulative_bytes_total: bytes_total,
            }))
        })
    }

    /// Exclusive access is the interior mutex: readers block for the
    /// duration of the vacuum instead of observing a closed store.
    fn compact(&self, control: &CompactionControl) -> Result<CompactStats, StoreError> {
        self.with_snapshot(|snapshot| {
            let mut stats = CompactStats::default();

            if let Some(ttl) = control.history_ttl {
                let ttl_ms = ttl.as_millis().min(u128::from(u64::MAX)) as u64;
                for (ident, client) in &mut snapshot.client_files {
                    if client.expired {
                        continue;
                    }
                    let last_seen = control
                        .last_client_accesses
                        .get(ident)
                        .copied()
                        .unwrap_or(0)
                        .max(client.last_seen);
                    if control.now.saturating_sub(last_seen) > ttl_ms {
                        client.expired = true;
                        stats.clients_expired += 1;
                    }
                }
            }

            let min_locked = snapshot
                .client_files
                .values()
                .filter(|client| !client.expired)
                .map(|client| client.locked_server_version)
                .min()
                .unwrap_or(snapshot.sync_version);

            let before = snapshot.entries.len();
            let mut reclaimed = 0u64;
            snapshot.entries.retain(|entry| {
                if entry.server_version <= min_locked {
                    reclaimed += entry.data.len() as u64;
                    false
                } else {
                    true
                }
            });
            stats.entries_trimmed = (before - snapshot.entries.len()) as u64;
            stats.bytes_reclaimed = reclaimed;
            snapshot.base_version = snapshot.base_version.max(min_locked);

            if stats.entries_trimmed > 0 || stats.clients_expired > 0 {
                snapshot.realm_version += 1;
                self.persist(snapshot)?;
            }
            info!(
                trimmed = stats.entries_trimmed,
                expired = stats.clients_expired,
                "compacted realm history"
            );
            Ok(stats)
        })
    }

    fn reopen_after_compaction(&self) -> Result<(), StoreError> {
        let bytes = std::fs::read(&self.path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(snapshot);
        Ok(())
    }

    fn close_for_deletion(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(snapshot) = guard.take() {
            // Best effort; the file may be deleted right after.
            let _ = self.persist(&snapshot);
        }
    }
}

/// Opens [`FileHistoryStore`] instances for the server core.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHistoryFactory;

impl HistoryFactory for FileHistoryFactory {
    fn open(&self, real_path: &Path) -> Result<Arc<dyn HistoryStore>, StoreError> {
        Ok(Arc::new(FileHistoryStore::open(real_path)?))
    }
}
