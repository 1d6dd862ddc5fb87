//! Axum adapter for syncd.
//!
//! Exposes the sync WebSocket endpoint (`GET /sync`) and the minimal admin
//! surface the core depends on:
//!
//! - `GET /health` - liveness probe
//! - `GET /api/info` - open connections and realm names (admin)
//! - `POST /api/compact` / `POST /api/compact/{*vpath}` - history
//!   compaction (admin)
//! - `DELETE /api/realm/{*vpath}` - realm deletion
//!
//! Handlers delegate to the shared [`SyncServer`](syncd_server::SyncServer).

mod error;
mod handlers;
mod routes;
mod state;

pub use error::HttpError;
pub use routes::create_router;
pub use state::{AppState, AxumContext};
