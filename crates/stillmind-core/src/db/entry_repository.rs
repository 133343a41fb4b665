//! Entry repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use crate::error::{Error, Result};
use crate::models::{Entry, EntryId, EntryRef, SyncConflict, SyncStatus, Tombstone};
use libsql::params::Params;
use libsql::{Connection, Row, Value};

const ENTRY_COLUMNS: &str = "id, client_id, server_id, content, created_at, last_modified, \
                             duration_minutes, prompt_id, word_count, sync_status";

/// libSQL access to the `entries`, `tombstones` and `sync_conflicts` tables
pub struct LibSqlEntryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or overwrite an entry by id.
    ///
    /// An existing `server_id` is never replaced, and `client_id` keeps the
    /// value from the first insert.
    pub async fn upsert(&self, entry: &Entry) -> Result<()> {
        let sql = format!(
            "INSERT INTO entries ({ENTRY_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                server_id = COALESCE(entries.server_id, excluded.server_id),
                content = excluded.content,
                created_at = excluded.created_at,
                last_modified = excluded.last_modified,
                duration_minutes = excluded.duration_minutes,
                prompt_id = excluded.prompt_id,
                word_count = excluded.word_count,
                sync_status = excluded.sync_status"
        );
        self.conn.execute(&sql, entry_params(entry)).await?;
        Ok(())
    }

    /// Get an entry by id
    pub async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?");
        let mut rows = self.conn.query(&sql, [id.as_millis()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    /// Resolve any entry reference to the local id
    pub async fn resolve(&self, reference: &EntryRef) -> Result<Option<EntryId>> {
        let mut rows = match reference {
            EntryRef::ById(id) => {
                self.conn
                    .query("SELECT id FROM entries WHERE id = ?", [id.as_millis()])
                    .await?
            }
            EntryRef::ByClientId(client_id) => {
                self.conn
                    .query(
                        "SELECT id FROM entries WHERE client_id = ? LIMIT 1",
                        [client_id.as_str()],
                    )
                    .await?
            }
            EntryRef::ByServerId(server_id) => {
                self.conn
                    .query(
                        "SELECT id FROM entries WHERE server_id = ? LIMIT 1",
                        [*server_id],
                    )
                    .await?
            }
        };

        match rows.next().await? {
            Some(row) => Ok(Some(EntryId::from_millis(row.get::<i64>(0)?))),
            None => Ok(None),
        }
    }

    /// List entries, most recently modified first
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             ORDER BY last_modified DESC, id DESC
             LIMIT ? OFFSET ?"
        );
        let rows = self
            .conn
            .query(&sql, [limit as i64, offset as i64])
            .await?;
        collect_entries(rows).await
    }

    /// List entries that are not yet synced
    pub async fn list_unsynced(&self) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE sync_status != ?
             ORDER BY id ASC"
        );
        let rows = self
            .conn
            .query(&sql, [SyncStatus::Synced.as_str()])
            .await?;
        collect_entries(rows).await
    }

    /// Set `sync_status = synced` on a local id, optionally only when
    /// `last_modified` still equals the pushed value
    pub async fn mark_synced(
        &self,
        id: EntryId,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE entries SET sync_status = ?1
                 WHERE id = ?2 AND (?3 IS NULL OR last_modified = ?3)",
                Params::Positional(vec![
                    Value::Text(SyncStatus::Synced.as_str().to_string()),
                    Value::Integer(id.as_millis()),
                    pushed_last_modified.map_or(Value::Null, Value::Integer),
                ]),
            )
            .await?;
        Ok(changed > 0)
    }

    /// Assign the server id (first assignment wins). The entry is marked
    /// synced only while `last_modified` matches the pushed value.
    pub async fn set_server_id(
        &self,
        id: EntryId,
        server_id: i64,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE entries
                 SET server_id = COALESCE(server_id, ?1),
                     sync_status = CASE
                         WHEN ?3 IS NULL OR last_modified = ?3 THEN ?2
                         ELSE sync_status
                     END
                 WHERE id = ?4",
                Params::Positional(vec![
                    Value::Integer(server_id),
                    Value::Text(SyncStatus::Synced.as_str().to_string()),
                    pushed_last_modified.map_or(Value::Null, Value::Integer),
                    Value::Integer(id.as_millis()),
                ]),
            )
            .await?;
        Ok(changed > 0)
    }

    /// Delete an entry, recording a tombstone when the server knows it
    pub async fn delete(&self, id: EntryId) -> Result<()> {
        let Some(existing) = self.get(id).await? else {
            return Ok(());
        };

        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        if let Err(error) = self.delete_in_transaction(&existing).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(error);
        }
        if let Err(error) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(error.into());
        }
        Ok(())
    }

    async fn delete_in_transaction(&self, existing: &Entry) -> Result<()> {
        if let Some(server_id) = existing.server_id {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO tombstones (server_id, entry_id, deleted_at)
                     VALUES (?, ?, ?)",
                    [
                        server_id,
                        existing.id.as_millis(),
                        chrono::Utc::now().timestamp_millis(),
                    ],
                )
                .await?;
        }
        self.conn
            .execute(
                "DELETE FROM entries WHERE id = ?",
                [existing.id.as_millis()],
            )
            .await?;
        Ok(())
    }

    /// Number of stored entries
    pub async fn count(&self) -> Result<usize> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM entries", ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Pending tombstones, oldest first
    pub async fn list_tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut rows = self
            .conn
            .query(
                "SELECT server_id, entry_id, deleted_at FROM tombstones ORDER BY deleted_at ASC",
                (),
            )
            .await?;

        let mut tombstones = Vec::new();
        while let Some(row) = rows.next().await? {
            tombstones.push(Tombstone {
                server_id: row.get(0)?,
                entry_id: EntryId::from_millis(row.get::<i64>(1)?),
                deleted_at: row.get(2)?,
            });
        }
        Ok(tombstones)
    }

    /// Drop a tombstone once the server confirmed the deletion
    pub async fn remove_tombstone(&self, server_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM tombstones WHERE server_id = ?", [server_id])
            .await?;
        Ok(())
    }

    /// Record a last-write-wins rejection of incoming remote state
    pub async fn record_conflict(
        &self,
        entry_id: EntryId,
        local_last_modified: i64,
        incoming_last_modified: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    entry_id, local_last_modified, incoming_last_modified, resolved_at, strategy
                 ) VALUES (?, ?, ?, ?, ?)",
                Params::Positional(vec![
                    Value::Integer(entry_id.as_millis()),
                    Value::Integer(local_last_modified),
                    Value::Integer(incoming_last_modified),
                    Value::Integer(chrono::Utc::now().timestamp_millis()),
                    Value::Text("lww".to_string()),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Most recent conflicts first
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entry_id, local_last_modified, incoming_last_modified, resolved_at, strategy
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                entry_id: EntryId::from_millis(row.get::<i64>(1)?),
                local_last_modified: row.get(2)?,
                incoming_last_modified: row.get(3)?,
                resolved_at: row.get(4)?,
                strategy: row.get(5)?,
            });
        }
        Ok(conflicts)
    }

    /// Remove every entry, tombstone and conflict record
    pub async fn clear(&self) -> Result<()> {
        for table in ["entries", "tombstones", "sync_conflicts"] {
            self.conn
                .execute(&format!("DELETE FROM {table}"), ())
                .await?;
        }
        Ok(())
    }
}

/// Parse rows into entries, skipping rows that fail to decode
async fn collect_entries(mut rows: libsql::Rows) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        match parse_entry(&row) {
            Ok(entry) => entries.push(entry),
            Err(error) => tracing::warn!("Skipping unreadable entry row: {error}"),
        }
    }
    Ok(entries)
}

fn parse_entry(row: &Row) -> Result<Entry> {
    let sync_status: String = row.get(9)?;
    let sync_status = SyncStatus::parse(&sync_status)
        .ok_or_else(|| Error::Database(format!("unknown sync status `{sync_status}`")))?;

    Ok(Entry {
        id: EntryId::from_millis(row.get::<i64>(0)?),
        client_id: row.get(1)?,
        server_id: optional_integer(row, 2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        last_modified: row.get(5)?,
        duration_minutes: optional_integer(row, 6)?.and_then(|value| u32::try_from(value).ok()),
        prompt_id: optional_text(row, 7)?,
        word_count: u32::try_from(row.get::<i64>(8)?).unwrap_or(0),
        sync_status,
    })
}

fn optional_integer(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "column {idx}: expected integer, found {other:?}"
        ))),
    }
}

fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "column {idx}: expected text, found {other:?}"
        ))),
    }
}

fn entry_params(entry: &Entry) -> Params {
    Params::Positional(vec![
        Value::Integer(entry.id.as_millis()),
        Value::Text(entry.client_id.clone()),
        entry.server_id.map_or(Value::Null, Value::Integer),
        Value::Text(entry.content.clone()),
        Value::Integer(entry.created_at),
        Value::Integer(entry.last_modified),
        entry
            .duration_minutes
            .map_or(Value::Null, |minutes| Value::Integer(i64::from(minutes))),
        entry.prompt_id.clone().map_or(Value::Null, Value::Text),
        Value::Integer(i64::from(entry.word_count)),
        Value::Text(entry.sync_status.as_str().to_string()),
    ])
}
