//! Durable per-device mailboxes.
//!
//! One row per delivery leg, keyed by (message_id, sender_id,
//! recipient_device_id). Rows are written inside the fanout transaction and
//! consumed by a single destructive read; nothing updates them in between.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// A queued message for one recipient device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxEntry {
    /// The identifier the sender addressed: a group ID or the recipient user ID.
    pub recipient_id: String,
    pub message_id: i64,
    pub sender_id: String,
    pub sender_device_id: String,
    pub recipient_device_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub contents: String,
    pub encrypted: bool,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<MailboxEntry> {
    Ok(MailboxEntry {
        recipient_id: row.get(0)?,
        message_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_device_id: row.get(3)?,
        recipient_device_id: row.get(4)?,
        timestamp: row.get(5)?,
        contents: row.get(6)?,
        encrypted: row.get::<_, i32>(7)? != 0,
    })
}

/// Queue one leg. Runs on the caller's connection or transaction and never
/// commits by itself. A primary-key collision comes back as a
/// [`StorageError`] whose `conflict_kind()` is `DuplicateKey`.
pub fn enqueue(conn: &Connection, entry: &MailboxEntry) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO mailbox
         (recipient_id, message_id, sender_id, sender_device_id, recipient_device_id,
          message_timestamp, message_contents, message_encrypted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.recipient_id,
            entry.message_id,
            entry.sender_id,
            entry.sender_device_id,
            entry.recipient_device_id,
            entry.timestamp,
            entry.contents,
            entry.encrypted as i32,
        ],
    )?;
    Ok(())
}

/// Atomically remove and return every entry queued for `device_id`.
///
/// A single `DELETE ... RETURNING` statement, so concurrent readers never see
/// the same row twice. No ordering is promised across senders.
pub fn dequeue_all(conn: &Connection, device_id: &str) -> Result<Vec<MailboxEntry>, StorageError> {
    let mut stmt = conn.prepare(
        "DELETE FROM mailbox WHERE recipient_device_id = ?1
         RETURNING recipient_id, message_id, sender_id, sender_device_id, recipient_device_id,
                   message_timestamp, message_contents, message_encrypted",
    )?;
    let rows = stmt.query_map(params![device_id], entry_from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn pending_count(conn: &Connection, device_id: &str) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mailbox WHERE recipient_device_id = ?1",
        params![device_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
