//! Core domain types and port definitions for syncd.
//!
//! This crate contains the pure vocabulary of the sync protocol (versions,
//! salts, cursors, messages, the wire codec, the error taxonomy) plus the
//! port traits that the server core depends on: history store, access
//! control, metrics, transport. No networking or file I/O lives here.

pub mod paths;
pub mod ports;
pub mod protocol;
pub mod settings;

// Re-export the types that nearly every consumer needs.
pub use paths::{PathError, VirtualPath};
pub use protocol::cursor::{
    DownloadCursor, FileIdent, RequestIdent, Salt, SaltedFileIdent, SaltedVersion, SessionIdent,
    Timestamp, UploadCursor, Version,
};
pub use protocol::error::ProtocolError;
pub use protocol::messages::{ClientMessage, ServerMessage, UploadChangeset};
pub use settings::ServerConfig;
