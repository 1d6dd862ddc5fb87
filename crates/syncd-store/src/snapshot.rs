//! On-disk snapshot format.
//!
//! The whole store state serializes to one JSON document. The format is
//! versioned through the `format` field; unknown versions are rejected as
//! corrupt rather than guessed at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use syncd_core::ports::history::ClientType;
use syncd_core::{FileIdent, Salt, Timestamp, UploadCursor, Version};

pub const SNAPSHOT_FORMAT: u32 = 1;

/// One appended history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Server version this entry produced.
    pub server_version: Version,
    /// Client file the changeset originated from.
    pub origin_file_ident: FileIdent,
    pub origin_timestamp: Timestamp,
    /// The origin's client version integrated by this entry.
    pub last_integrated_client_version: Version,
    pub data: Vec<u8>,
}

/// Registry entry for one allocated client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFile {
    pub ident_salt: Salt,
    pub client_type: ClientType,
    /// Authoritative upload progress for the client file.
    pub upload_progress: UploadCursor,
    /// Version below which the client asserted it needs no server history.
    pub locked_server_version: Version,
    /// Set by TTL compaction; an expired file can no longer sync.
    pub expired: bool,
    /// For subserver-relayed files, the subserver file they hang off.
    pub proxy_of: Option<FileIdent>,
    /// Last time this client file was seen, raised by allocation,
    /// bootstrap, and integration.
    pub last_seen: Timestamp,
}

/// The full serialized store state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    /// Identity of this history instance; regenerated when the realm file
    /// is recreated, which is what makes divergence detectable.
    pub history_salt: Salt,
    /// Advances on every write transaction.
    pub realm_version: Version,
    /// Advances only when downloadable history is produced.
    pub sync_version: Version,
    /// Entries at or below this version have been compacted away.
    pub base_version: Version,
    pub entries: Vec<StoredEntry>,
    pub client_files: BTreeMap<FileIdent, ClientFile>,
    pub next_file_ident: FileIdent,
}

impl Snapshot {
    pub fn new(history_salt: Salt) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            history_salt,
            realm_version: 0,
            sync_version: 0,
            base_version: 0,
            entries: Vec::new(),
            client_files: BTreeMap::new(),
            next_file_ident: 1,
        }
    }
}
