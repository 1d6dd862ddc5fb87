//! The syncd server core.
//!
//! This crate coordinates, per realm file, all activity of all connected
//! clients: session lifecycles, per-file serialization of writes,
//! backpressure, cursor validation, changeset integration through a single
//! worker thread, and propagation of newly produced versions back to every
//! bound session.
//!
//! # Structure
//!
//! - `worker` - The integration worker thread and the auxiliary job pool
//! - `file` - The per-realm-file coordinator (`ServerFile`)
//! - `session` - The per-binding protocol state machine
//! - `connection` - Demultiplexes sessions onto one transport
//! - `server` - The server root: registry, worker, admin orchestration
//! - `transport` - In-process channel transport for embedding and tests

pub mod connection;
pub mod file;
pub mod server;
pub mod session;
pub mod transport;
pub mod worker;

pub use file::ServerFile;
pub use server::{ServerError, ServerInfo, SyncServer};
pub use transport::ChannelTransport;
