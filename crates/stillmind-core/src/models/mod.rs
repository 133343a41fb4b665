//! Data models for StillMind

mod entry;
mod sync_conflict;

pub use entry::{
    new_client_id, word_count, Entry, EntryId, EntryRef, SyncStatus, Tombstone,
};
pub use sync_conflict::SyncConflict;
