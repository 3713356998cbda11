//! Conversation index: one "latest excerpt" row per (owner, chat).
//!
//! Rows live in `chat_list`, the same table that records group membership
//! (a group member is an owner with a `Group` row for that chat). Concurrent
//! upserts are serialized by SQLite's `ON CONFLICT` handling; the `WHERE`
//! guard makes the row last-write-wins by wall clock, so a late upsert
//! carrying an older timestamp is ignored.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
}

impl ChatType {
    pub fn as_i64(self) -> i64 {
        match self {
            ChatType::Direct => 0,
            ChatType::Group => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            ChatType::Group
        } else {
            ChatType::Direct
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub owner_id: String,
    pub chat_id: String,
    pub excerpt: String,
    pub updated_at: f64,
    pub chat_type: ChatType,
    pub is_admin: bool,
}

/// One upsert request.
#[derive(Debug, Clone, Copy)]
pub struct SummaryUpdate<'a> {
    pub owner_id: &'a str,
    pub chat_id: &'a str,
    pub excerpt: &'a str,
    /// Only applied when the row is created; an existing row keeps its type.
    pub chat_type: ChatType,
    pub timestamp: f64,
}

/// Insert or refresh a summary row. Returns `false` when an existing row was
/// newer and the update was dropped.
pub fn upsert(conn: &Connection, update: &SummaryUpdate<'_>) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "INSERT INTO chat_list (user_id, chat_id, created_at, updated_at, excerpt, chat_type)
         VALUES (?1, ?2, ?3, ?3, ?4, ?5)
         ON CONFLICT (user_id, chat_id) DO UPDATE
         SET excerpt = excluded.excerpt, updated_at = excluded.updated_at
         WHERE excluded.updated_at >= chat_list.updated_at",
        params![
            update.owner_id,
            update.chat_id,
            update.timestamp,
            update.excerpt,
            update.chat_type.as_i64(),
        ],
    )?;
    Ok(affected > 0)
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        owner_id: row.get(0)?,
        chat_id: row.get(1)?,
        excerpt: row.get(2)?,
        updated_at: row.get(3)?,
        chat_type: ChatType::from_i64(row.get(4)?),
        is_admin: row.get::<_, i64>(5)? != 0,
    })
}

pub fn get(
    conn: &Connection,
    owner_id: &str,
    chat_id: &str,
) -> Result<Option<ConversationSummary>, StorageError> {
    let row = conn
        .query_row(
            "SELECT user_id, chat_id, excerpt, updated_at, chat_type, is_admin
             FROM chat_list WHERE user_id = ?1 AND chat_id = ?2",
            params![owner_id, chat_id],
            summary_from_row,
        )
        .optional()?;
    Ok(row)
}

/// All summaries for one owner, most recently updated first.
pub fn list_for_owner(
    conn: &Connection,
    owner_id: &str,
) -> Result<Vec<ConversationSummary>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, chat_id, excerpt, updated_at, chat_type, is_admin
         FROM chat_list WHERE user_id = ?1
         ORDER BY updated_at DESC",
    )?;
    let rows = stmt.query_map(params![owner_id], summary_from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}
