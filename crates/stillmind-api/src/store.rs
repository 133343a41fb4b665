//! libSQL persistence for users, magic-link tokens and entries.

use std::path::Path;

use libsql::params::Params;
use libsql::{Builder, Connection, Database, Row, Value};
use stillmind_core::models::word_count;
use stillmind_core::remote::wire::RemoteEntry;
use tokio::sync::Mutex;

use crate::error::AppError;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT UNIQUE NOT NULL,
        created_at INTEGER NOT NULL,
        last_login INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS auth_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT UNIQUE NOT NULL,
        email TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        client_ip TEXT
    )",
    "CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        client_id TEXT,
        timestamp INTEGER NOT NULL,
        duration INTEGER,
        entry TEXT NOT NULL,
        prompt_id TEXT,
        word_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        last_modified INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_auth_tokens_expires ON auth_tokens(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_entries_user_timestamp ON entries(user_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_entries_user_id ON entries(user_id, id)",
];

const ENTRY_COLUMNS: &str =
    "id, timestamp, duration, entry, prompt_id, word_count, created_at, last_modified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
}

/// Why a magic-link token could not be redeemed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Unknown,
    Expired,
    Used,
}

impl TokenRejection {
    pub const fn message(self) -> &'static str {
        match self {
            Self::Unknown => "Invalid or expired token",
            Self::Expired => "Token has expired",
            Self::Used => "Token has already been used",
        }
    }
}

/// Entry fields written by create and update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWrite {
    /// Device-side correlation id; creates carrying one are idempotent
    pub client_id: Option<String>,
    pub timestamp: i64,
    pub duration: Option<u32>,
    pub entry: String,
    pub prompt_id: Option<String>,
    pub created_at: i64,
    pub last_modified: i64,
}

/// Result of an update against a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The stored copy is newer; the write was acknowledged but ignored
    Stale,
    NotFound,
}

/// Server-side store. Every statement runs on one serialized connection.
pub struct EntryStore {
    _db: Database,
    conn: Mutex<Connection>,
}

impl EntryStore {
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                AppError::Config(format!("Cannot create {}: {error}", parent.display()))
            })?;
        }
        let db = Builder::new_local(path.to_string_lossy().as_ref())
            .build()
            .await
            .map_err(storage_error)?;
        Self::init(db).await
    }

    pub async fn open_in_memory() -> Result<Self, AppError> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(storage_error)?;
        Self::init(db).await
    }

    async fn init(db: Database) -> Result<Self, AppError> {
        let conn = db.connect().map_err(storage_error)?;
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute("PRAGMA foreign_keys = ON;", ())
            .await
            .map_err(storage_error)?;
        for statement in SCHEMA {
            conn.execute(statement, ()).await.map_err(storage_error)?;
        }
        ensure_client_id_column(&conn).await?;
        tracing::info!("Database initialized");
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    /// Create the user if needed and return its id
    pub async fn upsert_user(&self, email: &str, now_ms: i64) -> Result<i64, AppError> {
        let conn = self.conn.lock().await;
        let email = email.to_lowercase();
        conn.execute(
            "INSERT INTO users (email, created_at) VALUES (?, ?) ON CONFLICT(email) DO NOTHING",
            Params::Positional(vec![Value::Text(email.clone()), Value::Integer(now_ms)]),
        )
        .await
        .map_err(storage_error)?;

        let mut rows = conn
            .query("SELECT id FROM users WHERE email = ?", [email.as_str()])
            .await
            .map_err(storage_error)?;
        match rows.next().await.map_err(storage_error)? {
            Some(row) => row.get::<i64>(0).map_err(storage_error),
            None => Err(AppError::internal("User row missing after insert")),
        }
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, email FROM users WHERE email = ?",
                [email.to_lowercase()],
            )
            .await
            .map_err(storage_error)?;
        match rows.next().await.map_err(storage_error)? {
            Some(row) => Ok(Some(User {
                id: row.get::<i64>(0).map_err(storage_error)?,
                email: row.get::<String>(1).map_err(storage_error)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn save_magic_token(
        &self,
        token: &str,
        email: &str,
        expires_at_ms: i64,
        now_ms: i64,
        client_ip: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO auth_tokens (token, email, expires_at, created_at, client_ip)
             VALUES (?, ?, ?, ?, ?)",
            Params::Positional(vec![
                Value::Text(token.to_string()),
                Value::Text(email.to_lowercase()),
                Value::Integer(expires_at_ms),
                Value::Integer(now_ms),
                client_ip.map_or(Value::Null, |ip| Value::Text(ip.to_string())),
            ]),
        )
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    /// Redeem a magic-link token exactly once and return the email it was
    /// issued for.
    pub async fn consume_magic_token(
        &self,
        token: &str,
        now_ms: i64,
    ) -> Result<Result<String, TokenRejection>, AppError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT email, expires_at, used FROM auth_tokens WHERE token = ?",
                [token],
            )
            .await
            .map_err(storage_error)?;
        let Some(row) = rows.next().await.map_err(storage_error)? else {
            return Ok(Err(TokenRejection::Unknown));
        };
        let email = row.get::<String>(0).map_err(storage_error)?;
        let expires_at = row.get::<i64>(1).map_err(storage_error)?;
        let used = row.get::<i64>(2).map_err(storage_error)? != 0;
        drop(rows);

        if expires_at < now_ms {
            return Ok(Err(TokenRejection::Expired));
        }
        if used {
            return Ok(Err(TokenRejection::Used));
        }

        conn.execute("UPDATE auth_tokens SET used = 1 WHERE token = ?", [token])
            .await
            .map_err(storage_error)?;
        conn.execute(
            "UPDATE users SET last_login = ? WHERE email = ?",
            Params::Positional(vec![Value::Integer(now_ms), Value::Text(email.clone())]),
        )
        .await
        .map_err(storage_error)?;
        Ok(Ok(email))
    }

    /// Drop expired tokens and return how many were removed
    pub async fn delete_expired_tokens(&self, now_ms: i64) -> Result<u64, AppError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM auth_tokens WHERE expires_at < ?", [now_ms])
            .await
            .map_err(storage_error)
    }

    /// One page of a user's entries, newest timestamp first
    pub async fn list_entries(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RemoteEntry>, AppError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut rows = conn
            .query(
                &sql,
                [user_id, i64::from(limit), i64::from(offset)],
            )
            .await
            .map_err(storage_error)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_error)? {
            entries.push(parse_entry(&row)?);
        }
        Ok(entries)
    }

    pub async fn get_entry(&self, user_id: i64, id: i64) -> Result<Option<RemoteEntry>, AppError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ? AND id = ?");
        let mut rows = conn
            .query(&sql, [user_id, id])
            .await
            .map_err(storage_error)?;
        match rows.next().await.map_err(storage_error)? {
            Some(row) => Ok(Some(parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    /// Create an entry. A second create with the same user and client id
    /// returns the existing id, applying the write when it is newer. Creates
    /// without a client id always insert.
    pub async fn create_entry(&self, user_id: i64, write: &EntryWrite) -> Result<i64, AppError> {
        let conn = self.conn.lock().await;
        if let Some(client_id) = write.client_id.as_deref() {
            let mut rows = conn
                .query(
                    "SELECT id, last_modified FROM entries WHERE user_id = ? AND client_id = ?",
                    Params::Positional(vec![
                        Value::Integer(user_id),
                        Value::Text(client_id.to_string()),
                    ]),
                )
                .await
                .map_err(storage_error)?;
            if let Some(row) = rows.next().await.map_err(storage_error)? {
                let id = row.get::<i64>(0).map_err(storage_error)?;
                let last_modified = row.get::<i64>(1).map_err(storage_error)?;
                drop(rows);
                if write.last_modified > last_modified {
                    apply_update(&conn, user_id, id, write).await?;
                }
                tracing::debug!("Create for known client id {client_id} mapped to {id}");
                return Ok(id);
            }
        }

        conn.execute(
            "INSERT INTO entries
                (user_id, client_id, timestamp, duration, entry, prompt_id, word_count,
                 created_at, last_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            Params::Positional(vec![
                Value::Integer(user_id),
                optional_text(write.client_id.as_deref()),
                Value::Integer(write.timestamp),
                optional_integer(write.duration),
                Value::Text(write.entry.clone()),
                optional_text(write.prompt_id.as_deref()),
                Value::Integer(i64::from(word_count(&write.entry))),
                Value::Integer(write.created_at),
                Value::Integer(write.last_modified),
            ]),
        )
        .await
        .map_err(storage_error)?;
        Ok(conn.last_insert_rowid())
    }

    /// Update an entry the user owns unless the stored copy is newer
    pub async fn update_entry(
        &self,
        user_id: i64,
        id: i64,
        write: &EntryWrite,
    ) -> Result<UpdateOutcome, AppError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT last_modified FROM entries WHERE user_id = ? AND id = ?",
                [user_id, id],
            )
            .await
            .map_err(storage_error)?;
        let Some(row) = rows.next().await.map_err(storage_error)? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let stored = row.get::<i64>(0).map_err(storage_error)?;
        drop(rows);

        if write.last_modified < stored {
            tracing::debug!("Ignoring stale update for entry {id}");
            return Ok(UpdateOutcome::Stale);
        }
        apply_update(&conn, user_id, id, write).await?;
        Ok(UpdateOutcome::Applied)
    }

    pub async fn delete_entry(&self, user_id: i64, id: i64) -> Result<bool, AppError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM entries WHERE user_id = ? AND id = ?",
                [user_id, id],
            )
            .await
            .map_err(storage_error)?;
        Ok(changed > 0)
    }
}

async fn apply_update(
    conn: &Connection,
    user_id: i64,
    id: i64,
    write: &EntryWrite,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE entries
         SET entry = ?, duration = ?, prompt_id = ?, word_count = ?, last_modified = ?
         WHERE user_id = ? AND id = ?",
        Params::Positional(vec![
            Value::Text(write.entry.clone()),
            optional_integer(write.duration),
            optional_text(write.prompt_id.as_deref()),
            Value::Integer(i64::from(word_count(&write.entry))),
            Value::Integer(write.last_modified),
            Value::Integer(user_id),
            Value::Integer(id),
        ]),
    )
    .await
    .map_err(storage_error)?;
    Ok(())
}

fn parse_entry(row: &Row) -> Result<RemoteEntry, AppError> {
    let duration = match row.get_value(2).map_err(storage_error)? {
        Value::Integer(minutes) => u32::try_from(minutes).ok(),
        _ => None,
    };
    let prompt_id = match row.get_value(4).map_err(storage_error)? {
        Value::Text(prompt_id) => Some(prompt_id),
        _ => None,
    };
    Ok(RemoteEntry {
        id: row.get::<i64>(0).map_err(storage_error)?,
        timestamp: row.get::<i64>(1).map_err(storage_error)?,
        duration,
        entry: row.get::<String>(3).map_err(storage_error)?,
        prompt_id,
        word_count: u32::try_from(row.get::<i64>(5).map_err(storage_error)?).ok(),
        created_at: row.get::<i64>(6).map_err(storage_error)?,
        last_modified: row.get::<i64>(7).map_err(storage_error)?,
    })
}

fn optional_integer(value: Option<u32>) -> Value {
    value.map_or(Value::Null, |value| Value::Integer(i64::from(value)))
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

/// Add `entries.client_id` to databases created before it existed
async fn ensure_client_id_column(conn: &Connection) -> Result<(), AppError> {
    let mut rows = conn
        .query("SELECT 1 FROM pragma_table_info('entries') WHERE name = 'client_id'", ())
        .await
        .map_err(storage_error)?;
    let present = rows.next().await.map_err(storage_error)?.is_some();
    drop(rows);
    if !present {
        conn.execute("ALTER TABLE entries ADD COLUMN client_id TEXT", ())
            .await
            .map_err(storage_error)?;
        tracing::info!("Added client_id column to entries");
    }
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_user_client
         ON entries(user_id, client_id) WHERE client_id IS NOT NULL",
        (),
    )
    .await
    .map_err(storage_error)?;
    Ok(())
}

fn storage_error(error: impl std::fmt::Display) -> AppError {
    AppError::internal(format!("Database error: {error}"))
}
