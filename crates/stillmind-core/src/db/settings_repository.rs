//! Settings repository implementation

use crate::error::Result;
use libsql::Connection;
use serde_json::Value;

/// Trait for key/value settings storage (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    /// Read a setting, `None` when it was never written
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a setting, replacing any previous value
    async fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove a setting
    async fn remove(&self, key: &str) -> Result<()>;
}

/// libSQL implementation of `SettingsRepository`
///
/// Values are stored as JSON text so callers can keep arbitrary shapes.
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM settings WHERE key = ?", [key])
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let raw: String = row.get(0)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                [key, raw.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?", [key])
            .await?;
        Ok(())
    }
}
