//! Decoded protocol messages.
//!
//! The server core consumes [`ClientMessage`] values and produces
//! [`ServerMessage`] values; framing and byte-level encoding live in
//! [`super::wire`]. Each session on a connection multiplexes its own
//! message stream through the `session_ident` field; `session_ident == 0`
//! on an ERROR frame addresses the whole connection.

use super::cursor::{
    DownloadCursor, FileIdent, RequestIdent, Salt, SaltedFileIdent, SaltedVersion, SessionIdent,
    Timestamp, UploadCursor, Version,
};

/// One changeset carried by an UPLOAD message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChangeset {
    /// Position of this changeset in the client-side history, paired with
    /// the latest server version integrated when it was produced.
    pub upload_cursor: UploadCursor,
    /// Time of origin on the producing device.
    pub origin_timestamp: Timestamp,
    /// Originating client file, or 0 when the uploading client itself is
    /// the origin.
    pub origin_file_ident: FileIdent,
    /// Opaque serialized changeset.
    pub data: Vec<u8>,
}

impl UploadChangeset {
    /// Size this changeset accounts for in backpressure byte counters.
    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One history entry carried by a DOWNLOAD message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Server version produced by this entry.
    pub server_version: Version,
    /// Client file the entry originated from.
    pub origin_file_ident: FileIdent,
    /// Time of origin on the producing device.
    pub origin_timestamp: Timestamp,
    /// Latest client version of the receiving file integrated at this point.
    pub last_integrated_client_version: Version,
    /// Opaque serialized changeset.
    pub data: Vec<u8>,
}

/// The body of a DOWNLOAD message, possibly deflate-compressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadBody {
    /// True when `bytes` holds the deflate stream rather than the raw body.
    pub is_compressed: bool,
    /// Size of the body before compression (equals `bytes.len()` when not
    /// compressed).
    pub uncompressed_size: usize,
    /// Raw or compressed serialized history entries.
    pub bytes: Vec<u8>,
}

/// Messages received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open a session against a realm identified by virtual path.
    Bind {
        session_ident: SessionIdent,
        /// Virtual path of the realm, e.g. `/foo/bar`.
        path: String,
        /// Signed access token; verified by the access-control port.
        signed_user_token: String,
        /// True when the client needs the server to allocate a client file
        /// identifier before it can send IDENT.
        need_client_file_ident: bool,
        /// True when the client is itself a sync server for a partial view.
        is_subserver: bool,
    },

    /// Identify the client-side file and resume positions for a session.
    Ident {
        session_ident: SessionIdent,
        client_file_ident: FileIdent,
        client_file_ident_salt: Salt,
        /// Resumed download scan position.
        scan_server_version: Version,
        scan_client_version: Version,
        /// Latest server version the client has fully integrated.
        latest_server_version: Version,
        latest_server_version_salt: Salt,
    },

    /// Upload a batch of client-produced changesets.
    Upload {
        session_ident: SessionIdent,
        /// Upload progress reported by the client, as a cursor.
        progress_client_version: Version,
        progress_server_version: Version,
        /// Version below which the client no longer needs server history.
        locked_server_version: Version,
        changesets: Vec<UploadChangeset>,
    },

    /// Request a notification when the download scan catches up.
    Mark {
        session_ident: SessionIdent,
        request_ident: RequestIdent,
    },

    /// Close a session.
    Unbind { session_ident: SessionIdent },

    /// Heartbeat. `rtt` is the round-trip time the client measured for the
    /// previous PING/PONG exchange (0 on the first PING).
    Ping { timestamp: Timestamp, rtt: u64 },
}

impl ClientMessage {
    /// Session this message addresses; `None` for connection-scoped PING.
    pub const fn session_ident(&self) -> Option<SessionIdent> {
        match self {
            Self::Bind { session_ident, .. }
            | Self::Ident { session_ident, .. }
            | Self::Upload { session_ident, .. }
            | Self::Mark { session_ident, .. }
            | Self::Unbind { session_ident } => Some(*session_ident),
            Self::Ping { .. } => None,
        }
    }

    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "BIND",
            Self::Ident { .. } => "IDENT",
            Self::Upload { .. } => "UPLOAD",
            Self::Mark { .. } => "MARK",
            Self::Unbind { .. } => "UNBIND",
            Self::Ping { .. } => "PING",
        }
    }
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Deliver a freshly allocated client file identifier.
    Ident {
        session_ident: SessionIdent,
        client_file_ident: SaltedFileIdent,
    },

    /// Deliver a run of server-side history.
    Download {
        session_ident: SessionIdent,
        /// Download cursor after this message is applied.
        progress: DownloadCursor,
        /// Salted server version the scan is converging towards.
        end: SaltedVersion,
        /// The session's authoritative upload progress.
        upload_progress: UploadCursor,
        /// Bytes of history remaining after this message.
        downloadable_bytes: u64,
        num_changesets: u64,
        body: DownloadBody,
    },

    /// Acknowledge that the download scan caught up to the version current
    /// when the corresponding MARK request was received.
    Mark {
        session_ident: SessionIdent,
        request_ident: RequestIdent,
    },

    /// Legacy relayed allocation (protocol versions <= 23). Never emitted
    /// by this server; retained so the codec covers the full vocabulary.
    Alloc {
        session_ident: SessionIdent,
        file_ident: FileIdent,
    },

    /// Report a session-level (`session_ident != 0`) or connection-level
    /// (`session_ident == 0`) error.
    Error {
        session_ident: SessionIdent,
        error_code: u32,
        message: String,
        /// True when the client should reconnect after its backoff.
        try_again: bool,
    },

    /// Acknowledge an UNBIND; the session identifier may be reused after
    /// this frame.
    Unbound { session_ident: SessionIdent },

    /// Heartbeat response, echoing the PING timestamp.
    Pong { timestamp: Timestamp },
}

impl ServerMessage {
    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ident { .. } => "IDENT",
            Self::Download { .. } => "DOWNLOAD",
            Self::Mark { .. } => "MARK",
            Self::Alloc { .. } => "ALLOC",
            Self::Error { .. } => "ERROR",
            Self::Unbound { .. } => "UNBOUND",
            Self::Pong { .. } => "PONG",
        }
    }
}
