//! SQLite storage layer for courier.
//!
//! Owns the single database connection, creates the schema, and classifies
//! store failures so the fanout engine can tell a write conflict (retry with a
//! fresh message ID) from a fatal error. Component tables (mailbox,
//! membership, conversation index) are read and written by their own modules
//! through [`Storage::connection`] or an open [`Transaction`]; this module
//! keeps the CRUD for the externally owned rows the core only consumes:
//! devices, session keys, push tokens, profiles and contacts.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{
    ffi, params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};

/// How long a writer waits on a locked database file before the attempt is
/// reported as a serialization conflict.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

/// Why a transactional write lost against another writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Primary-key collision, e.g. two legs with the same
    /// (message_id, sender_id, recipient_device_id).
    DuplicateKey,
    /// The store could not serialize this transaction against a concurrent one.
    Serialization,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::DuplicateKey => write!(f, "duplicate key"),
            ConflictKind::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl StorageError {
    /// Classify this error as a retryable write conflict, if it is one.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::ConstraintViolation
                    if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        || err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Some(ConflictKind::DuplicateKey)
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Some(ConflictKind::Serialization)
                }
                _ => None,
            },
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Verification state of a device. Only verified devices receive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Pending,
    Verified,
}

impl DeviceState {
    pub fn as_i64(self) -> i64 {
        match self {
            DeviceState::Pending => 0,
            DeviceState::Verified => 1,
        }
    }
}

/// Profile data the core reads to title push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    pub user_id: String,
    pub name: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTokenRow {
    pub device_id: String,
    pub user_id: String,
    pub token: String,
    pub updated_at: f64,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create a private in-memory database. Used by tests and `--ephemeral` runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                user_id       TEXT NOT NULL,
                device_id     TEXT NOT NULL,
                device_state  INTEGER NOT NULL DEFAULT 0,
                created_at    REAL NOT NULL,
                updated_at    REAL NOT NULL,
                PRIMARY KEY (user_id, device_id)
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user_state ON devices(user_id, device_state);

            CREATE TABLE IF NOT EXISTS group_list (
                chat_id     TEXT PRIMARY KEY,
                creator_id  TEXT NOT NULL,
                title       TEXT NOT NULL DEFAULT '',
                created_at  REAL NOT NULL,
                updated_at  REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_list (
                user_id     TEXT NOT NULL,
                chat_id     TEXT NOT NULL,
                created_at  REAL NOT NULL,
                updated_at  REAL NOT NULL,
                excerpt     TEXT NOT NULL DEFAULT '',
                chat_type   INTEGER NOT NULL DEFAULT 0,
                is_admin    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, chat_id)
            );
            CREATE INDEX IF NOT EXISTS idx_chat_list_chat ON chat_list(chat_id, chat_type);

            CREATE TABLE IF NOT EXISTS mailbox (
                recipient_id         TEXT NOT NULL,
                message_id           INTEGER NOT NULL,
                sender_id            TEXT NOT NULL,
                sender_device_id     TEXT NOT NULL,
                recipient_device_id  TEXT NOT NULL,
                message_timestamp    REAL NOT NULL,
                message_contents     TEXT NOT NULL,
                message_encrypted    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, sender_id, recipient_device_id)
            );
            CREATE INDEX IF NOT EXISTS idx_mailbox_device ON mailbox(recipient_device_id);

            CREATE TABLE IF NOT EXISTS session_keys (
                key    TEXT PRIMARY KEY,
                value  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS push_tokens (
                device_id   TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                token       TEXT NOT NULL,
                updated_at  REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS profiles (
                user_id       TEXT PRIMARY KEY,
                name          TEXT,
                phone_number  TEXT
            );

            CREATE TABLE IF NOT EXISTS contacts (
                user_id  TEXT NOT NULL,
                peer_id  TEXT NOT NULL,
                name     TEXT NOT NULL,
                PRIMARY KEY (user_id, peer_id)
            );
            ",
        )?;
        Ok(())
    }

    /// Borrow the connection for reads outside a transaction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin an IMMEDIATE transaction. SQLite transactions are serializable;
    /// IMMEDIATE takes the write lock up front so a competing writer fails
    /// with `SQLITE_BUSY` at `BEGIN` instead of half-way through a fanout.
    pub fn begin_immediate(&self) -> Result<Transaction<'_>, StorageError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Insert a device or update its state.
    pub fn upsert_device(
        &self,
        user_id: &str,
        device_id: &str,
        state: DeviceState,
    ) -> Result<(), StorageError> {
        let now = now_secs_f64();
        self.conn.execute(
            "INSERT INTO devices (user_id, device_id, device_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (user_id, device_id)
             DO UPDATE SET device_state = excluded.device_state, updated_at = excluded.updated_at",
            params![user_id, device_id, state.as_i64(), now],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session keys
    // -----------------------------------------------------------------------

    pub fn put_session_key(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO session_keys (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_session_key(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM session_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_session_key(&self, key: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM session_keys WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Push tokens
    // -----------------------------------------------------------------------

    pub fn set_push_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO push_tokens (device_id, user_id, token, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![device_id, user_id, token, now_secs_f64()],
        )?;
        Ok(())
    }

    pub fn get_push_token(&self, device_id: &str) -> Result<Option<PushTokenRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT device_id, user_id, token, updated_at FROM push_tokens WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(PushTokenRow {
                        device_id: row.get(0)?,
                        user_id: row.get(1)?,
                        token: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Profiles and contacts (read-mostly)
    // -----------------------------------------------------------------------

    pub fn upsert_profile(&self, row: &ProfileRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO profiles (user_id, name, phone_number) VALUES (?1, ?2, ?3)",
            params![row.user_id, row.name, row.phone_number],
        )?;
        Ok(())
    }

    pub fn upsert_contact(
        &self,
        owner_id: &str,
        peer_id: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO contacts (user_id, peer_id, name) VALUES (?1, ?2, ?3)",
            params![owner_id, peer_id, name],
        )?;
        Ok(())
    }

    /// Name under which `viewer_id` knows `user_id`: the viewer's contact
    /// alias, else the profile name, else the phone number. Empty when
    /// nothing is known.
    pub fn display_name(&self, user_id: &str, viewer_id: &str) -> Result<String, StorageError> {
        let alias: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM contacts WHERE user_id = ?1 AND peer_id = ?2",
                params![viewer_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(alias) = alias.filter(|a| !a.is_empty()) {
            return Ok(alias);
        }

        let profile: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT name, phone_number FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let name = match profile {
            Some((name, phone)) => name
                .filter(|n| !n.is_empty())
                .or(phone)
                .unwrap_or_default(),
            None => String::new(),
        };
        Ok(name)
    }
}

/// Current wall-clock time in seconds with sub-second precision.
pub fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Default database file inside a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("courier.db")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
