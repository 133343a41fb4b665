//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::EntryId;

/// Pull-phase conflict where the incoming remote copy lost to local state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Entry involved in the conflict
    pub entry_id: EntryId,
    /// Local `last_modified` when the conflict occurred
    pub local_last_modified: i64,
    /// Incoming remote `last_modified` that was rejected
    pub incoming_last_modified: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
