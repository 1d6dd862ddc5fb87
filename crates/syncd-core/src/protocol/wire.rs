//! The wire codec.
//!
//! Every message is one WebSocket binary frame: an ASCII head line
//! terminated by `\n`, followed by an optional binary body. Head fields
//! are space-separated 63-bit decimal integers (plus the message name and
//! flag fields encoded as `0`/`1`). Bodies that carry changesets are a
//! sequence of records, each a header line followed by the changeset
//! bytes:
//!
//! ```text
//! upload <sess> <progress_cv> <progress_sv> <locked_sv> <num> <compressed> <uncompressed_size> <body_size>\n
//!   record: <client_version> <last_integrated_sv> <origin_timestamp> <origin_file_ident> <size>\n<data>
//! download <sess> <progress_sv> <progress_cv> <end_version> <end_salt> <upload_cv> <upload_lisv>
//!          <downloadable_bytes> <num> <compressed> <uncompressed_size> <body_size>\n
//!   record: <server_version> <origin_file_ident> <origin_timestamp> <last_integrated_cv> <size>\n<data>
//! ```
//!
//! Bodies above a caller-chosen threshold may be deflate-compressed; the
//! `compressed` flag and both sizes are carried in the head so the reader
//! can verify the inflated size.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

use super::cursor::{DownloadCursor, SaltedFileIdent, SaltedVersion, UploadCursor, MAX_PROTOCOL_INT};
use super::error::ProtocolError;
use super::messages::{
    ClientMessage, DownloadBody, HistoryEntry, ServerMessage, UploadChangeset,
};

/// Maximum size of the head line of any message.
pub const MAX_HEAD_SIZE: usize = 512;
/// Maximum size of a virtual path carried by BIND.
pub const MAX_PATH_SIZE: usize = 1024;
/// Maximum size of a signed user token carried by BIND.
pub const MAX_TOKEN_SIZE: usize = 16384;
/// Maximum size of an ERROR message string.
pub const MAX_ERROR_MESSAGE_SIZE: usize = 1024;
/// Maximum total frame size accepted by the decoder.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Decoder failure, mapping 1:1 onto a connection-level protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown message name")]
    UnknownMessage,
    #[error("malformed message head")]
    BadSyntax,
    #[error("message exceeds size limits")]
    LimitsExceeded,
    #[error("body failed to decompress")]
    BadDecompression,
    #[error("malformed changeset record header")]
    BadChangesetHeaderSyntax,
    #[error("changeset record size does not match body")]
    BadChangesetSize,
}

impl From<WireError> for ProtocolError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::UnknownMessage => Self::UnknownMessage,
            WireError::BadSyntax => Self::BadSyntax,
            WireError::LimitsExceeded => Self::LimitsExceeded,
            WireError::BadDecompression => Self::BadDecompression,
            WireError::BadChangesetHeaderSyntax => Self::BadChangesetHeaderSyntax,
            WireError::BadChangesetSize => Self::BadChangesetSize,
        }
    }
}

// ── Head parsing ─────────────────────────────────────────────────────────────

struct Head<'a> {
    fields: std::str::Split<'a, char>,
}

impl<'a> Head<'a> {
    fn split(frame: &'a [u8]) -> Result<(Self, &'a [u8]), WireError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(WireError::LimitsExceeded);
        }
        let newline = frame
            .iter()
            .take(MAX_HEAD_SIZE)
            .position(|&b| b == b'\n')
            .ok_or(WireError::LimitsExceeded)?;
        let head = std::str::from_utf8(&frame[..newline]).map_err(|_| WireError::BadSyntax)?;
        let body = &frame[newline + 1..];
        Ok((
            Self {
                fields: head.split(' '),
            },
            body,
        ))
    }

    fn name(&mut self) -> Result<&'a str, WireError> {
        self.fields.next().ok_or(WireError::BadSyntax)
    }

    fn int(&mut self) -> Result<u64, WireError> {
        let field = self.fields.next().ok_or(WireError::BadSyntax)?;
        let value: u64 = field.parse().map_err(|_| WireError::BadSyntax)?;
        if value > MAX_PROTOCOL_INT {
            return Err(WireError::BadSyntax);
        }
        Ok(value)
    }

    fn size(&mut self) -> Result<usize, WireError> {
        usize::try_from(self.int()?).map_err(|_| WireError::BadSyntax)
    }

    fn flag(&mut self) -> Result<bool, WireError> {
        match self.fields.next() {
            Some("0") => Ok(false),
            Some("1") => Ok(true),
            _ => Err(WireError::BadSyntax),
        }
    }

    fn finish(mut self) -> Result<(), WireError> {
        if self.fields.next().is_some() {
            return Err(WireError::BadSyntax);
        }
        Ok(())
    }
}

// ── Body compression ─────────────────────────────────────────────────────────

/// Deflate `body` when it is at least `threshold` bytes and compression
/// actually shrinks it. Returns the flag and the bytes to put on the wire.
pub fn compress_if_profitable(body: Vec<u8>, threshold: usize) -> (bool, Vec<u8>) {
    if body.len() < threshold {
        return (false, body);
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&body).is_err() {
        return (false, body);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < body.len() => (true, compressed),
        _ => (false, body),
    }
}

/// Inflate `bytes` into exactly `uncompressed_size` bytes.
pub fn decompress(bytes: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, WireError> {
    if uncompressed_size > MAX_FRAME_SIZE {
        return Err(WireError::LimitsExceeded);
    }
    let mut out = Vec::with_capacity(uncompressed_size);
    let mut decoder = DeflateDecoder::new(bytes).take(uncompressed_size as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| WireError::BadDecompression)?;
    if out.len() != uncompressed_size {
        return Err(WireError::BadDecompression);
    }
    Ok(out)
}

fn resolve_body(
    body: &[u8],
    compressed: bool,
    uncompressed_size: usize,
    body_size: usize,
) -> Result<Vec<u8>, WireError> {
    if body.len() != body_size {
        return Err(WireError::BadSyntax);
    }
    if compressed {
        decompress(body, uncompressed_size)
    } else {
        if uncompressed_size != body_size {
            return Err(WireError::BadSyntax);
        }
        Ok(body.to_vec())
    }
}

// ── Changeset record framing ────────────────────────────────────────────────

fn read_record_header(input: &[u8]) -> Result<(Head<'_>, &[u8]), WireError> {
    let newline = input
        .iter()
        .take(MAX_HEAD_SIZE)
        .position(|&b| b == b'\n')
        .ok_or(WireError::BadChangesetHeaderSyntax)?;
    let head =
        std::str::from_utf8(&input[..newline]).map_err(|_| WireError::BadChangesetHeaderSyntax)?;
    Ok((
        Head {
            fields: head.split(' '),
        },
        &input[newline + 1..],
    ))
}

/// Serialize UPLOAD changeset records.
pub fn encode_upload_changesets(changesets: &[UploadChangeset]) -> Vec<u8> {
    let mut out = Vec::new();
    for uc in changesets {
        let _ = write!(
            out,
            "{} {} {} {} {}\n",
            uc.upload_cursor.client_version,
            uc.upload_cursor.last_integrated_server_version,
            uc.origin_timestamp,
            uc.origin_file_ident,
            uc.data.len(),
        );
        out.extend_from_slice(&uc.data);
    }
    out
}

/// Parse UPLOAD changeset records, expecting exactly `num` of them.
pub fn decode_upload_changesets(
    mut input: &[u8],
    num: usize,
) -> Result<Vec<UploadChangeset>, WireError> {
    let mut out = Vec::with_capacity(num);
    for _ in 0..num {
        let (mut head, rest) = read_record_header(input)?;
        let client_version = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let last_isv = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let origin_timestamp = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let origin_file_ident = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let size = head.size().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        head.finish()
            .map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        if rest.len() < size {
            return Err(WireError::BadChangesetSize);
        }
        let (data, rest) = rest.split_at(size);
        out.push(UploadChangeset {
            upload_cursor: UploadCursor::new(client_version, last_isv),
            origin_timestamp,
            origin_file_ident,
            data: data.to_vec(),
        });
        input = rest;
    }
    if !input.is_empty() {
        return Err(WireError::BadChangesetSize);
    }
    Ok(out)
}

/// Serialize DOWNLOAD history entries.
pub fn encode_history_entries(entries: &[HistoryEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        let _ = write!(
            out,
            "{} {} {} {} {}\n",
            entry.server_version,
            entry.origin_file_ident,
            entry.origin_timestamp,
            entry.last_integrated_client_version,
            entry.data.len(),
        );
        out.extend_from_slice(&entry.data);
    }
    out
}

/// Parse DOWNLOAD history entries, expecting exactly `num` of them.
pub fn decode_history_entries(
    mut input: &[u8],
    num: usize,
) -> Result<Vec<HistoryEntry>, WireError> {
    let mut out = Vec::with_capacity(num);
    for _ in 0..num {
        let (mut head, rest) = read_record_header(input)?;
        let server_version = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let origin_file_ident = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let origin_timestamp = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let last_icv = head.int().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        let size = head.size().map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        head.finish()
            .map_err(|_| WireError::BadChangesetHeaderSyntax)?;
        if rest.len() < size {
            return Err(WireError::BadChangesetSize);
        }
        let (data, rest) = rest.split_at(size);
        out.push(HistoryEntry {
            server_version,
            origin_file_ident,
            origin_timestamp,
            last_integrated_client_version: last_icv,
            data: data.to_vec(),
        });
        input = rest;
    }
    if !input.is_empty() {
        return Err(WireError::BadChangesetSize);
    }
    Ok(out)
}

// ── Client messages ─────────────────────────────────────────────────────────

/// Encode a client message into one frame. Used by clients and tests.
pub fn encode_client_message(msg: &ClientMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        ClientMessage::Bind {
            session_ident,
            path,
            signed_user_token,
            need_client_file_ident,
            is_subserver,
        } => {
            let _ = write!(
                out,
                "bind {} {} {} {} {}\n",
                session_ident,
                u8::from(*need_client_file_ident),
                u8::from(*is_subserver),
                path.len(),
                signed_user_token.len(),
            );
            out.extend_from_slice(path.as_bytes());
            out.extend_from_slice(signed_user_token.as_bytes());
        }
        ClientMessage::Ident {
            session_ident,
            client_file_ident,
            client_file_ident_salt,
            scan_server_version,
            scan_client_version,
            latest_server_version,
            latest_server_version_salt,
        } => {
            let _ = write!(
                out,
                "ident {session_ident} {client_file_ident} {client_file_ident_salt} \
                 {scan_server_version} {scan_client_version} {latest_server_version} \
                 {latest_server_version_salt}\n",
            );
        }
        ClientMessage::Upload {
            session_ident,
            progress_client_version,
            progress_server_version,
            locked_server_version,
            changesets,
        } => {
            let body = encode_upload_changesets(changesets);
            let uncompressed_size = body.len();
            let (compressed, body) = compress_if_profitable(body, usize::MAX);
            let _ = write!(
                out,
                "upload {session_ident} {progress_client_version} {progress_server_version} \
                 {locked_server_version} {} {} {uncompressed_size} {}\n",
                changesets.len(),
                u8::from(compressed),
                body.len(),
            );
            out.extend_from_slice(&body);
        }
        ClientMessage::Mark {
            session_ident,
            request_ident,
        } => {
            let _ = write!(out, "mark {session_ident} {request_ident}\n");
        }
        ClientMessage::Unbind { session_ident } => {
            let _ = write!(out, "unbind {session_ident}\n");
        }
        ClientMessage::Ping { timestamp, rtt } => {
            let _ = write!(out, "ping {timestamp} {rtt}\n");
        }
    }
    out
}

/// Decode one client frame.
pub fn decode_client_message(frame: &[u8]) -> Result<ClientMessage, WireError> {
    let (mut head, body) = Head::split(frame)?;
    let msg = match head.name()? {
        "bind" => {
            let session_ident = head.int()?;
            let need_client_file_ident = head.flag()?;
            let is_subserver = head.flag()?;
            let path_size = head.size()?;
            let token_size = head.size()?;
            head.finish()?;
            if path_size > MAX_PATH_SIZE || token_size > MAX_TOKEN_SIZE {
                return Err(WireError::LimitsExceeded);
            }
            if body.len() != path_size + token_size {
                return Err(WireError::BadSyntax);
            }
            let path = std::str::from_utf8(&body[..path_size])
                .map_err(|_| WireError::BadSyntax)?
                .to_owned();
            let signed_user_token = std::str::from_utf8(&body[path_size..])
                .map_err(|_| WireError::BadSyntax)?
                .to_owned();
            ClientMessage::Bind {
                session_ident,
                path,
                signed_user_token,
                need_client_file_ident,
                is_subserver,
            }
        }
        "ident" => {
            let msg = ClientMessage::Ident {
                session_ident: head.int()?,
                client_file_ident: head.int()?,
                client_file_ident_salt: head.int()?,
                scan_server_version: head.int()?,
                scan_client_version: head.int()?,
                latest_server_version: head.int()?,
                latest_server_version_salt: head.int()?,
            };
            head.finish()?;
            if !body.is_empty() {
                return Err(WireError::BadSyntax);
            }
            msg
        }
        "upload" => {
            let session_ident = head.int()?;
            let progress_client_version = head.int()?;
            let progress_server_version = head.int()?;
            let locked_server_version = head.int()?;
            let num = head.size()?;
            let compressed = head.flag()?;
            let uncompressed_size = head.size()?;
            let body_size = head.size()?;
            head.finish()?;
            let records = resolve_body(body, compressed, uncompressed_size, body_size)?;
            let changesets = decode_upload_changesets(&records, num)?;
            ClientMessage::Upload {
                session_ident,
                progress_client_version,
                progress_server_version,
                locked_server_version,
                changesets,
            }
        }
        "mark" => {
            let msg = ClientMessage::Mark {
                session_ident: head.int()?,
                request_ident: head.int()?,
            };
            head.finish()?;
            msg
        }
        "unbind" => {
            let msg = ClientMessage::Unbind {
                session_ident: head.int()?,
            };
            head.finish()?;
            msg
        }
        "ping" => {
            let msg = ClientMessage::Ping {
                timestamp: head.int()?,
                rtt: head.int()?,
            };
            head.finish()?;
            msg
        }
        _ => return Err(WireError::UnknownMessage),
    };
    Ok(msg)
}

// ── Server messages ─────────────────────────────────────────────────────────

/// Encode a server message into one frame.
pub fn encode_server_message(msg: &ServerMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        ServerMessage::Ident {
            session_ident,
            client_file_ident,
        } => {
            let _ = write!(
                out,
                "ident {session_ident} {} {}\n",
                client_file_ident.ident, client_file_ident.salt,
            );
        }
        ServerMessage::Download {
            session_ident,
            progress,
            end,
            upload_progress,
            downloadable_bytes,
            num_changesets,
            body,
        } => {
            let _ = write!(
                out,
                "download {session_ident} {} {} {} {} {} {} {downloadable_bytes} \
                 {num_changesets} {} {} {}\n",
                progress.server_version,
                progress.last_integrated_client_version,
                end.version,
                end.salt,
                upload_progress.client_version,
                upload_progress.last_integrated_server_version,
                u8::from(body.is_compressed),
                body.uncompressed_size,
                body.bytes.len(),
            );
            out.extend_from_slice(&body.bytes);
        }
        ServerMessage::Mark {
            session_ident,
            request_ident,
        } => {
            let _ = write!(out, "mark {session_ident} {request_ident}\n");
        }
        ServerMessage::Alloc {
            session_ident,
            file_ident,
        } => {
            let _ = write!(out, "alloc {session_ident} {file_ident}\n");
        }
        ServerMessage::Error {
            session_ident,
            error_code,
            message,
            try_again,
        } => {
            let message = &message[..message.len().min(MAX_ERROR_MESSAGE_SIZE)];
            let _ = write!(
                out,
                "error {session_ident} {error_code} {} {}\n",
                u8::from(*try_again),
                message.len(),
            );
            out.extend_from_slice(message.as_bytes());
        }
        ServerMessage::Unbound { session_ident } => {
            let _ = write!(out, "unbound {session_ident}\n");
        }
        ServerMessage::Pong { timestamp } => {
            let _ = write!(out, "pong {timestamp}\n");
        }
    }
    out
}

/// Decode one server frame. Used by clients and tests.
pub fn decode_server_message(frame: &[u8]) -> Result<ServerMessage, WireError> {
    let (mut head, body) = Head::split(frame)?;
    let msg = match head.name()? {
        "ident" => {
            let msg = ServerMessage::Ident {
                session_ident: head.int()?,
                client_file_ident: SaltedFileIdent::new(head.int()?, head.int()?),
            };
            head.finish()?;
            msg
        }
        "download" => {
            let session_ident = head.int()?;
            let progress = DownloadCursor::new(head.int()?, head.int()?);
            let end = SaltedVersion::new(head.int()?, head.int()?);
            let upload_progress = UploadCursor::new(head.int()?, head.int()?);
            let downloadable_bytes = head.int()?;
            let num_changesets = head.int()?;
            let is_compressed = head.flag()?;
            let uncompressed_size = head.size()?;
            let body_size = head.size()?;
            head.finish()?;
            if body.len() != body_size {
                return Err(WireError::BadSyntax);
            }
            ServerMessage::Download {
                session_ident,
                progress,
                end,
                upload_progress,
                downloadable_bytes,
                num_changesets,
                body: DownloadBody {
                    is_compressed,
                    uncompressed_size,
                    bytes: body.to_vec(),
                },
            }
        }
        "mark" => {
            let msg = ServerMessage::Mark {
                session_ident: head.int()?,
                request_ident: head.int()?,
            };
            head.finish()?;
            msg
        }
        "alloc" => {
            let msg = ServerMessage::Alloc {
                session_ident: head.int()?,
                file_ident: head.int()?,
            };
            head.finish()?;
            msg
        }
        "error" => {
            let session_ident = head.int()?;
            let error_code = u32::try_from(head.int()?).map_err(|_| WireError::BadSyntax)?;
            let try_again = head.flag()?;
            let size = head.size()?;
            head.finish()?;
            if body.len() != size {
                return Err(WireError::BadSyntax);
            }
            ServerMessage::Error {
                session_ident,
                error_code,
                message: std::str::from_utf8(body)
                    .map_err(|_| WireError::BadSyntax)?
                    .to_owned(),
                try_again,
            }
        }
        "unbound" => {
            let msg = ServerMessage::Unbound {
                session_ident: head.int()?,
            };
            head.finish()?;
            msg
        }
        "pong" => {
            let msg = ServerMessage::Pong {
                timestamp: head.int()?,
            };
            head.finish()?;
            msg
        }
        _ => return Err(WireError::UnknownMessage),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changeset(cv: u64, isv: u64, data: &[u8]) -> UploadChangeset {
        UploadChangeset {
            upload_cursor: UploadCursor::new(cv, isv),
            origin_timestamp: 1_700_000_000_000,
            origin_file_ident: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn bind_round_trips() {
        let msg = ClientMessage::Bind {
            session_ident: 1,
            path: "/foo/bar".to_owned(),
            signed_user_token: "token-abc".to_owned(),
            need_client_file_ident: true,
            is_subserver: false,
        };
        let frame = encode_client_message(&msg);
        assert_eq!(decode_client_message(&frame).unwrap(), msg);
    }

    #[test]
    fn upload_round_trips_with_binary_changesets() {
        let msg = ClientMessage::Upload {
            session_ident: 7,
            progress_client_version: 3,
            progress_server_version: 2,
            locked_server_version: 1,
            changesets: vec![
                changeset(2, 1, b"\x00\x01binary\ndata"),
                changeset(3, 2, b""),
            ],
        };
        let frame = encode_client_message(&msg);
        assert_eq!(decode_client_message(&frame).unwrap(), msg);
    }

    #[test]
    fn error_round_trips() {
        let msg = ServerMessage::Error {
            session_ident: 0,
            error_code: ProtocolError::BadSyntax.code(),
            message: "malformed head".to_owned(),
            try_again: false,
        };
        let frame = encode_server_message(&msg);
        assert_eq!(decode_server_message(&frame).unwrap(), msg);
    }

    #[test]
    fn unknown_message_name_is_rejected() {
        assert_eq!(
            decode_client_message(b"frobnicate 1\n"),
            Err(WireError::UnknownMessage)
        );
    }

    #[test]
    fn missing_newline_in_head_is_rejected() {
        assert_eq!(
            decode_client_message(b"unbind 1"),
            Err(WireError::LimitsExceeded)
        );
    }

    #[test]
    fn trailing_head_fields_are_rejected() {
        assert_eq!(
            decode_client_message(b"unbind 1 2\n"),
            Err(WireError::BadSyntax)
        );
    }

    #[test]
    fn oversized_path_is_rejected() {
        let frame = format!("bind 1 0 0 {} 0\n", MAX_PATH_SIZE + 1);
        assert_eq!(
            decode_client_message(frame.as_bytes()),
            Err(WireError::LimitsExceeded)
        );
    }

    #[test]
    fn truncated_changeset_data_is_rejected() {
        // Header claims 100 bytes of data but the body ends early.
        let mut frame = b"upload 1 1 0 0 1 0 9 9\n".to_vec();
        frame.extend_from_slice(b"1 0 0 0 4\nab");
        let err = decode_client_message(&frame).unwrap_err();
        assert!(matches!(
            err,
            WireError::BadSyntax | WireError::BadChangesetSize
        ));
    }

    #[test]
    fn compression_is_skipped_when_unprofitable() {
        let (compressed, bytes) = compress_if_profitable(b"ab".to_vec(), 1024);
        assert!(!compressed);
        assert_eq!(bytes, b"ab");
    }

    #[test]
    fn compression_round_trips() {
        let body: Vec<u8> = std::iter::repeat(b"downloadable history ")
            .take(64)
            .flatten()
            .copied()
            .collect();
        let (compressed, bytes) = compress_if_profitable(body.clone(), 16);
        assert!(compressed);
        assert!(bytes.len() < body.len());
        assert_eq!(decompress(&bytes, body.len()).unwrap(), body);
    }

    #[test]
    fn decompression_with_wrong_size_fails() {
        let (compressed, bytes) =
            compress_if_profitable(vec![b'x'; 4096], 16);
        assert!(compressed);
        assert_eq!(decompress(&bytes, 17), Err(WireError::BadDecompression));
    }

    #[test]
    fn history_entries_round_trip() {
        let entries = vec![
            HistoryEntry {
                server_version: 5,
                origin_file_ident: 2,
                origin_timestamp: 123,
                last_integrated_client_version: 4,
                data: b"entry-one".to_vec(),
            },
            HistoryEntry {
                server_version: 6,
                origin_file_ident: 3,
                origin_timestamp: 124,
                last_integrated_client_version: 4,
                data: vec![],
            },
        ];
        let body = encode_history_entries(&entries);
        assert_eq!(decode_history_entries(&body, 2).unwrap(), entries);
    }
}
