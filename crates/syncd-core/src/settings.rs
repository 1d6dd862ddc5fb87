//! Server configuration.
//!
//! All fields are optional in the serialized form to support partial
//! config files and graceful defaults; the `effective_*` accessors apply
//! the fallbacks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::cursor::FileIdent;

/// Default cap on queued upload bytes per realm file before backpressure.
pub const DEFAULT_MAX_UPLOAD_BACKLOG: u64 = 16 * 1024 * 1024;

/// Default cap on the uncompressed body of one DOWNLOAD message.
pub const DEFAULT_MAX_DOWNLOAD_SIZE: usize = 128 * 1024;

/// Default body size above which DOWNLOAD compression is attempted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default idle-connection timeout in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

/// Default bound on time spent in soft-close in milliseconds.
pub const DEFAULT_SOFT_CLOSE_TIMEOUT_MS: u64 = 30_000;

/// Default auxiliary worker pool size.
pub const DEFAULT_AUX_WORKERS: usize = 4;

/// Server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding all realm files.
    pub root_dir: Option<PathBuf>,

    /// Cap on queued upload bytes per realm file; the sole backpressure
    /// knob.
    pub max_upload_backlog: Option<u64>,

    /// Cap on the uncompressed body of one DOWNLOAD message.
    pub max_download_size: Option<usize>,

    /// Body size above which DOWNLOAD compression is attempted.
    pub compression_threshold: Option<usize>,

    /// Idle-connection timeout in milliseconds.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Bound on time spent waiting for the peer to close after an ERROR
    /// frame, in milliseconds.
    pub soft_close_timeout_ms: Option<u64>,

    /// Auxiliary worker pool size.
    pub aux_workers: Option<usize>,

    /// Expire client files not seen for this many seconds during history
    /// compaction. `None` disables TTL expiry and last-access tracking.
    pub history_ttl_secs: Option<u64>,

    /// Client file identifiers refused per virtual path.
    pub client_file_blacklists: HashMap<String, Vec<FileIdent>>,

    /// Shared secret required by the admin HTTP surface. `None` leaves the
    /// admin surface open (development only).
    pub admin_token: Option<String>,
}

impl ServerConfig {
    /// Configuration with explicit defaults for every tunable.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            root_dir: None,
            max_upload_backlog: Some(DEFAULT_MAX_UPLOAD_BACKLOG),
            max_download_size: Some(DEFAULT_MAX_DOWNLOAD_SIZE),
            compression_threshold: Some(DEFAULT_COMPRESSION_THRESHOLD),
            heartbeat_timeout_ms: Some(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            soft_close_timeout_ms: Some(DEFAULT_SOFT_CLOSE_TIMEOUT_MS),
            aux_workers: Some(DEFAULT_AUX_WORKERS),
            history_ttl_secs: None,
            client_file_blacklists: HashMap::new(),
            admin_token: None,
        }
    }

    #[must_use]
    pub fn effective_max_upload_backlog(&self) -> u64 {
        self.max_upload_backlog.unwrap_or(DEFAULT_MAX_UPLOAD_BACKLOG)
    }

    #[must_use]
    pub fn effective_max_download_size(&self) -> usize {
        self.max_download_size.unwrap_or(DEFAULT_MAX_DOWNLOAD_SIZE)
    }

    #[must_use]
    pub fn effective_compression_threshold(&self) -> usize {
        self.compression_threshold
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD)
    }

    #[must_use]
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_timeout_ms
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        )
    }

    #[must_use]
    pub fn effective_soft_close_timeout(&self) -> Duration {
        Duration::from_millis(
            self.soft_close_timeout_ms
                .unwrap_or(DEFAULT_SOFT_CLOSE_TIMEOUT_MS),
        )
    }

    #[must_use]
    pub fn effective_aux_workers(&self) -> usize {
        self.aux_workers.unwrap_or(DEFAULT_AUX_WORKERS).max(1)
    }

    #[must_use]
    pub fn effective_history_ttl(&self) -> Option<Duration> {
        self.history_ttl_secs.map(Duration::from_secs)
    }

    /// Blacklisted client file identifiers for a virtual path.
    #[must_use]
    pub fn blacklist_for(&self, virtual_path: &str) -> &[FileIdent] {
        self.client_file_blacklists
            .get(virtual_path)
            .map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::default();
        assert_eq!(
            config.effective_max_upload_backlog(),
            DEFAULT_MAX_UPLOAD_BACKLOG
        );
        assert_eq!(config.effective_aux_workers(), DEFAULT_AUX_WORKERS);
        assert_eq!(config.effective_history_ttl(), None);
        assert!(config.blacklist_for("/foo").is_empty());
    }

    #[test]
    fn aux_workers_is_at_least_one() {
        let config = ServerConfig {
            aux_workers: Some(0),
            ..ServerConfig::default()
        };
        assert_eq!(config.effective_aux_workers(), 1);
    }

    #[test]
    fn partial_config_deserializes() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "max_upload_backlog": 1024 }"#).unwrap();
        assert_eq!(config.effective_max_upload_backlog(), 1024);
        assert_eq!(
            config.effective_max_download_size(),
            DEFAULT_MAX_DOWNLOAD_SIZE
        );
    }

    #[test]
    fn blacklists_round_trip() {
        let mut config = ServerConfig::with_defaults();
        config
            .client_file_blacklists
            .insert("/foo".to_owned(), vec![1, 7]);
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.blacklist_for("/foo"), [1, 7]);
    }
}
