//! Shared application state type.

use std::sync::Arc;

use syncd_server::SyncServer;

/// Context shared by all handlers.
pub struct AxumContext {
    /// The server root every handler delegates to.
    pub server: Arc<SyncServer>,
}

/// Application state shared across all handlers.
pub type AppState = Arc<AxumContext>;
