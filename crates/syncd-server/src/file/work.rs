//! The work unit handed from a coordinator to the worker.

use std::sync::Arc;
use std::time::Duration;

use syncd_core::ports::history::{
    FileIdentAllocSlot, IntegratableChangesets, IntegrationResult, VersionInfo,
};

/// The atomic batch of file-identifier allocations and inbound changesets
/// captured by `group_unblock_work`.
///
/// Between hand-off and hand-back the unit is owned by the worker thread.
/// The one exception is `changesets_from_downstream`: the coordinator keeps
/// a clone of the same `Arc` so concurrent session bootstraps can read it;
/// nobody mutates it while the unit is in flight.
pub struct WorkUnit {
    /// One slot per pending allocation request, in request order. The
    /// worker fills `slot.ident`.
    pub file_ident_alloc_slots: Vec<FileIdentAllocSlot>,
    /// Inbound changesets keyed by client file, moved off the blocked side.
    pub changesets_from_downstream: Arc<IntegratableChangesets>,
    /// Bytes moved from the blocked to the unblocked counter.
    pub unblocked_bytes: u64,
    pub request_compaction: bool,
    pub request_deletion: bool,

    // Filled in by the worker:
    pub version_info: VersionInfo,
    pub produced_new_realm_version: bool,
    pub produced_new_sync_version: bool,
    pub integration_result: IntegrationResult,
    pub integration_time: Duration,
}

impl WorkUnit {
    /// True when there is nothing for the worker to do and the unit can
    /// skip straight to post-processing.
    pub fn is_noop(&self) -> bool {
        self.file_ident_alloc_slots.is_empty()
            && self.changesets_from_downstream.is_empty()
            && !self.request_compaction
            && !self.request_deletion
    }
}
