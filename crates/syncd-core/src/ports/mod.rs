//! Port definitions for syncd.
//!
//! Ports are the trait seams between the server core and its
//! collaborators: the on-disk history engine, access-token verification,
//! the metrics sink, and the framed transport. Implementations live in
//! adapter crates (`syncd-store`, `syncd-axum`) or in test fakes.

pub mod access;
pub mod history;
pub mod metrics;
pub mod transport;

pub use access::{AccessControl, AccessError, AccessOp, AllowAll, Principal};
pub use history::{
    BootstrapError, ClientSessionBootstrap, ClientType, CompactStats, CompactionControl,
    DownloadInfo, FileIdentAllocSlot, HistoryFactory, HistoryStore, IntegratableChangesetList,
    IntegratableChangesets, IntegrationError, IntegrationOutcome, IntegrationResult, StoreError,
    VersionInfo,
};
pub use metrics::{MetricsSink, NoopMetrics};
pub use transport::{Transport, TransportError};
