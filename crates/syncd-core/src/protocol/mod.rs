//! Sync protocol vocabulary.
//!
//! # Structure
//!
//! - `cursor` - Versions, salts, and the upload/download cursor algebra
//! - `messages` - Decoded client/server message structs
//! - `error` - The protocol error taxonomy and bootstrap-error mapping
//! - `wire` - The wire codec (text head + binary body, optional deflate)

pub mod cursor;
pub mod error;
pub mod messages;
pub mod wire;
