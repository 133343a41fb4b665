//! Last-write-wins merge of one remote entry into local state.

use crate::models::Entry;
use crate::remote::wire::RemoteEntry;

/// What to do with an incoming remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local copy exists
    Insert,
    /// Local copy is strictly older
    Overwrite,
    /// Local copy is as new or newer. `conflict` is set when local is strictly
    /// newer and the content differs.
    KeepLocal { conflict: bool },
}

impl MergeDecision {
    #[must_use]
    pub const fn applies_remote(self) -> bool {
        matches!(self, Self::Insert | Self::Overwrite)
    }
}

/// Decide by `last_modified`; ties keep the local copy
#[must_use]
pub fn decide(local: Option<&Entry>, remote: &RemoteEntry) -> MergeDecision {
    let Some(local) = local else {
        return MergeDecision::Insert;
    };

    if local.last_modified < remote.last_modified {
        MergeDecision::Overwrite
    } else {
        MergeDecision::KeepLocal {
            conflict: local.last_modified > remote.last_modified && local.content != remote.entry,
        }
    }
}
