//! Where a device keeps its session token between runs.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Storage for the bearer token of the current session
pub trait SessionPersistence: Send + Sync {
    fn load_token(&self) -> Result<Option<String>>;
    fn save_token(&self, token: &str) -> Result<()>;
    fn clear_token(&self) -> Result<()>;
}

/// Keeps the token for the lifetime of the process only
#[derive(Default)]
pub struct MemorySessionStore {
    token: Mutex<Option<String>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionPersistence for MemorySessionStore {
    fn load_token(&self) -> Result<Option<String>> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_token(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        Ok(())
    }

    fn clear_token(&self) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    token: String,
}

/// Persists the token as a small JSON document on disk
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionPersistence for FileSessionStore {
    fn load_token(&self) -> Result<Option<String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        match serde_json::from_str::<StoredSession>(&raw) {
            Ok(session) if !session.token.trim().is_empty() => Ok(Some(session.token)),
            Ok(_) => Ok(None),
            Err(error) => {
                tracing::warn!(
                    "Ignoring unreadable session file {}: {error}",
                    self.path.display()
                );
                Ok(None)
            }
        }
    }

    fn save_token(&self, token: &str) -> Result<()> {
        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string(&StoredSession {
            token: token.to_string(),
        })?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    fn clear_token(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn file_store_roundtrip_and_clear() {
        let tmp = tempdir().unwrap();
        let store = FileSessionStore::new(tmp.path().join("auth").join("session.json"));

        assert_eq!(store.load_token().unwrap(), None);
        store.save_token("token-1").unwrap();
        assert_eq!(store.load_token().unwrap().as_deref(), Some("token-1"));

        store.clear_token().unwrap();
        store.clear_token().unwrap();
        assert_eq!(store.load_token().unwrap(), None);
    }

    #[test]
    fn file_store_ignores_garbage() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(FileSessionStore::new(path).load_token().unwrap(), None);
    }
}
