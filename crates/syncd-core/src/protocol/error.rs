//! The protocol error taxonomy.
//!
//! Errors fall into two wire-visible classes: connection-level errors
//! (codes 1xx) poison the whole connection and are followed by soft-close;
//! session-level errors (codes 2xx) terminate only the offending session.
//! Transport failures never reach the wire; they are mapped once at the
//! connection boundary and tear the connection down without an ERROR frame.

use thiserror::Error;

use crate::ports::history::{BootstrapError, IntegrationError};

/// A protocol violation or server-side condition reported to a client
/// through an ERROR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // ── Connection level ──────────────────────────────────────────────────
    /// The connection is being closed deliberately; the client should
    /// reconnect after its configured backoff. Used for backpressure.
    #[error("connection closed (retry later)")]
    ConnectionClosed,

    #[error("unknown message type")]
    UnknownMessage,

    #[error("bad message syntax")]
    BadSyntax,

    #[error("frame or field size limits exceeded")]
    LimitsExceeded,

    #[error("session identifier does not denote a bound session")]
    BadSessionIdent,

    #[error("session identifier already bound on this connection")]
    ReuseOfSessionIdent,

    #[error("message received out of order for the session state")]
    BadMessageOrder,

    #[error("failed to decompress message body")]
    BadDecompression,

    #[error("bad syntax in changeset header")]
    BadChangesetHeaderSyntax,

    #[error("bad changeset size")]
    BadChangesetSize,

    // ── Session level ─────────────────────────────────────────────────────
    #[error("access token could not be verified")]
    BadAuthentication,

    #[error("malformed virtual path")]
    IllegalRealmPath,

    #[error("permission denied")]
    PermissionDenied,

    #[error("bad client file identifier")]
    BadClientFileIdent,

    #[error("bad server version")]
    BadServerVersion,

    #[error("bad client version")]
    BadClientVersion,

    #[error("client and server histories have diverged")]
    DivergingHistories,

    #[error("bad changeset")]
    BadChangeset,

    #[error("client file bound in another session on this connection")]
    BoundInOtherSession,

    #[error("bad origin file identifier in changeset")]
    BadOriginFileIdent,

    #[error("server file was deleted")]
    ServerFileDeleted,

    #[error("client file identifier is blacklisted")]
    ClientFileBlacklisted,

    #[error("client file expired from the server history")]
    ClientFileExpired,
}

impl ProtocolError {
    /// Stable numeric wire code.
    pub const fn code(self) -> u32 {
        match self {
            Self::ConnectionClosed => 100,
            Self::UnknownMessage => 102,
            Self::BadSyntax => 103,
            Self::LimitsExceeded => 104,
            Self::BadSessionIdent => 106,
            Self::ReuseOfSessionIdent => 107,
            Self::BadMessageOrder => 108,
            Self::BadDecompression => 109,
            Self::BadChangesetHeaderSyntax => 110,
            Self::BadChangesetSize => 111,
            Self::BadAuthentication => 203,
            Self::IllegalRealmPath => 204,
            Self::PermissionDenied => 206,
            Self::BadClientFileIdent => 208,
            Self::BadServerVersion => 209,
            Self::BadClientVersion => 210,
            Self::DivergingHistories => 211,
            Self::BadChangeset => 212,
            Self::BoundInOtherSession => 215,
            Self::BadOriginFileIdent => 216,
            Self::ServerFileDeleted => 218,
            Self::ClientFileBlacklisted => 219,
            Self::ClientFileExpired => 222,
        }
    }

    /// True when only the offending session is terminated; false when the
    /// whole connection soft-closes.
    pub const fn is_session_level(self) -> bool {
        self.code() >= 200
    }

    /// True when the client should reconnect after its backoff rather than
    /// treating the error as fatal.
    pub const fn try_again(self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Reverse of [`code`](Self::code), for clients and tests.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            100 => Self::ConnectionClosed,
            102 => Self::UnknownMessage,
            103 => Self::BadSyntax,
            104 => Self::LimitsExceeded,
            106 => Self::BadSessionIdent,
            107 => Self::ReuseOfSessionIdent,
            108 => Self::BadMessageOrder,
            109 => Self::BadDecompression,
            110 => Self::BadChangesetHeaderSyntax,
            111 => Self::BadChangesetSize,
            203 => Self::BadAuthentication,
            204 => Self::IllegalRealmPath,
            206 => Self::PermissionDenied,
            208 => Self::BadClientFileIdent,
            209 => Self::BadServerVersion,
            210 => Self::BadClientVersion,
            211 => Self::DivergingHistories,
            212 => Self::BadChangeset,
            215 => Self::BoundInOtherSession,
            216 => Self::BadOriginFileIdent,
            218 => Self::ServerFileDeleted,
            219 => Self::ClientFileBlacklisted,
            222 => Self::ClientFileExpired,
            _ => return None,
        })
    }
}

/// Map a history-store bootstrap rejection to its protocol error.
impl From<BootstrapError> for ProtocolError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::ClientFileExpired => Self::ClientFileExpired,
            BootstrapError::BadClientFileIdent | BootstrapError::BadClientType => {
                Self::BadClientFileIdent
            }
            BootstrapError::BadClientFileIdentSalt | BootstrapError::BadServerVersionSalt => {
                Self::DivergingHistories
            }
            BootstrapError::BadDownloadServerVersion | BootstrapError::BadServerVersion => {
                Self::BadServerVersion
            }
            BootstrapError::BadDownloadClientVersion => Self::BadClientVersion,
        }
    }
}

/// Map an integration rejection to the error that terminates the
/// offending session.
impl From<IntegrationError> for ProtocolError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::BadOriginFileIdent => Self::BadOriginFileIdent,
            IntegrationError::BadChangeset => Self::BadChangeset,
            IntegrationError::ClientFileExpired => Self::ClientFileExpired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            ProtocolError::ConnectionClosed,
            ProtocolError::UnknownMessage,
            ProtocolError::BadSyntax,
            ProtocolError::LimitsExceeded,
            ProtocolError::BadSessionIdent,
            ProtocolError::ReuseOfSessionIdent,
            ProtocolError::BadMessageOrder,
            ProtocolError::BadDecompression,
            ProtocolError::BadChangesetHeaderSyntax,
            ProtocolError::BadChangesetSize,
            ProtocolError::BadAuthentication,
            ProtocolError::IllegalRealmPath,
            ProtocolError::PermissionDenied,
            ProtocolError::BadClientFileIdent,
            ProtocolError::BadServerVersion,
            ProtocolError::BadClientVersion,
            ProtocolError::DivergingHistories,
            ProtocolError::BadChangeset,
            ProtocolError::BoundInOtherSession,
            ProtocolError::BadOriginFileIdent,
            ProtocolError::ServerFileDeleted,
            ProtocolError::ClientFileBlacklisted,
            ProtocolError::ClientFileExpired,
        ];
        for err in all {
            assert_eq!(ProtocolError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn classification_follows_code_ranges() {
        assert!(!ProtocolError::BadSyntax.is_session_level());
        assert!(!ProtocolError::ConnectionClosed.is_session_level());
        assert!(ProtocolError::ServerFileDeleted.is_session_level());
        assert!(ProtocolError::BadServerVersion.is_session_level());
    }

    #[test]
    fn only_connection_closed_is_retryable() {
        assert!(ProtocolError::ConnectionClosed.try_again());
        assert!(!ProtocolError::BadSyntax.try_again());
        assert!(!ProtocolError::ServerFileDeleted.try_again());
    }

    #[test]
    fn bootstrap_mapping_matches_contract() {
        use BootstrapError as B;
        use ProtocolError as P;
        let table = [
            (B::ClientFileExpired, P::ClientFileExpired),
            (B::BadClientFileIdent, P::BadClientFileIdent),
            (B::BadClientFileIdentSalt, P::DivergingHistories),
            (B::BadDownloadServerVersion, P::BadServerVersion),
            (B::BadDownloadClientVersion, P::BadClientVersion),
            (B::BadServerVersion, P::BadServerVersion),
            (B::BadServerVersionSalt, P::DivergingHistories),
            (B::BadClientType, P::BadClientFileIdent),
        ];
        for (from, to) in table {
            assert_eq!(ProtocolError::from(from), to);
        }
    }
}
