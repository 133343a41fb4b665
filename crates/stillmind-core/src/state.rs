//! Shared cross-platform state types.

use serde::Serialize;

/// Unified sync state shown by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Passive sync indicator published by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIndicator {
    pub state: SyncState,
    /// Unix ms of the last successful cycle
    pub last_sync_time: Option<i64>,
    /// Message of the most recent failed cycle, cleared on success
    pub last_error: Option<String>,
}

impl SyncIndicator {
    #[must_use]
    pub const fn new(online: bool) -> Self {
        Self {
            state: if online {
                SyncState::Synced
            } else {
                SyncState::Offline
            },
            last_sync_time: None,
            last_error: None,
        }
    }

    /// Reflect a connectivity transition without losing sync history
    pub fn set_online(&mut self, online: bool) {
        match (online, self.state) {
            (false, _) => self.state = SyncState::Offline,
            (true, SyncState::Offline) => {
                self.state = if self.last_error.is_some() {
                    SyncState::Error
                } else {
                    SyncState::Synced
                };
            }
            (true, _) => {}
        }
    }

    /// Short label for status bars
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self.state {
            SyncState::Offline => "Offline",
            SyncState::Syncing => "Syncing...",
            SyncState::Synced => "Synced",
            SyncState::Error => "Sync error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connectivity_transitions_keep_error_visible() {
        let mut indicator = SyncIndicator::new(true);
        indicator.state = SyncState::Error;
        indicator.last_error = Some("boom".to_string());

        indicator.set_online(false);
        assert_eq!(indicator.state, SyncState::Offline);

        indicator.set_online(true);
        assert_eq!(indicator.state, SyncState::Error);
        assert_eq!(indicator.label(), "Sync error");
    }

    #[test]
    fn starts_offline_when_disconnected() {
        assert_eq!(SyncIndicator::new(false).state, SyncState::Offline);
        assert_eq!(SyncIndicator::new(true).label(), "Synced");
    }
}
