//! Recipient resolution and group membership.
//!
//! A recipient identifier is first looked up in `group_list`. A hit makes it
//! a group whose members are the users that currently hold a group row for
//! it in `chat_list` (members come and go after creation). A miss makes it a
//! single user, addressed through that user's verified devices.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::conversations::ChatType;
use crate::storage::{now_secs_f64, DeviceState, Storage, StorageError};

/// Who a recipient identifier expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Individual {
        user_id: String,
        device_ids: Vec<String>,
    },
    Group {
        group_id: String,
        member_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub group_id: String,
    pub creator_id: String,
    pub title: String,
    pub created_at: f64,
}

/// A current group member as shown to other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub is_admin: bool,
    pub name: Option<String>,
}

fn collect_strings(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn is_group(conn: &Connection, recipient_id: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_list WHERE chat_id = ?1",
        params![recipient_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_verified_devices(conn: &Connection, user_id: &str) -> Result<Vec<String>, StorageError> {
    collect_strings(
        conn,
        "SELECT device_id FROM devices
         WHERE user_id = ?1 AND device_state = ?2
         ORDER BY device_id",
        params![user_id, DeviceState::Verified.as_i64()],
    )
}

pub fn list_group_members(conn: &Connection, group_id: &str) -> Result<Vec<String>, StorageError> {
    collect_strings(
        conn,
        "SELECT user_id FROM chat_list
         WHERE chat_id = ?1 AND chat_type = ?2
         ORDER BY user_id",
        params![group_id, ChatType::Group.as_i64()],
    )
}

pub fn is_group_admin(conn: &Connection, user_id: &str, group_id: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_list
         WHERE user_id = ?1 AND chat_id = ?2 AND chat_type = ?3 AND is_admin = 1",
        params![user_id, group_id, ChatType::Group.as_i64()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn is_group_member(conn: &Connection, user_id: &str, group_id: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_list WHERE user_id = ?1 AND chat_id = ?2 AND chat_type = ?3",
        params![user_id, group_id, ChatType::Group.as_i64()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Expand a recipient identifier.
pub fn resolve(conn: &Connection, recipient_id: &str) -> Result<Recipient, StorageError> {
    if is_group(conn, recipient_id)? {
        return Ok(Recipient::Group {
            group_id: recipient_id.to_string(),
            member_ids: list_group_members(conn, recipient_id)?,
        });
    }
    Ok(Recipient::Individual {
        user_id: recipient_id.to_string(),
        device_ids: list_verified_devices(conn, recipient_id)?,
    })
}

// ---------------------------------------------------------------------------
// Group administration
// ---------------------------------------------------------------------------

pub fn get_group(conn: &Connection, group_id: &str) -> Result<Option<GroupRow>, StorageError> {
    let row = conn
        .query_row(
            "SELECT chat_id, creator_id, title, created_at FROM group_list WHERE chat_id = ?1",
            params![group_id],
            |row| {
                Ok(GroupRow {
                    group_id: row.get(0)?,
                    creator_id: row.get(1)?,
                    title: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn insert_member(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
    is_admin: bool,
    now: f64,
) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "INSERT INTO chat_list (user_id, chat_id, created_at, updated_at, chat_type, is_admin)
         VALUES (?1, ?2, ?3, ?3, ?4, ?5)
         ON CONFLICT (user_id, chat_id) DO NOTHING",
        params![user_id, group_id, now, ChatType::Group.as_i64(), is_admin as i64],
    )?;
    Ok(affected > 0)
}

/// Create a group with a fresh UUID. The creator joins as admin; every
/// participant joins as a plain member. All-or-nothing.
pub fn create_group(
    storage: &Storage,
    creator_id: &str,
    title: &str,
    participants: &[String],
) -> Result<GroupRow, StorageError> {
    let group_id = uuid::Uuid::new_v4().to_string();
    let now = now_secs_f64();

    let tx = storage.begin_immediate()?;
    tx.execute(
        "INSERT INTO group_list (chat_id, creator_id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![group_id, creator_id, title, now],
    )?;
    insert_member(&tx, &group_id, creator_id, true, now)?;
    for participant in participants.iter().filter(|p| p.as_str() != creator_id) {
        insert_member(&tx, &group_id, participant, false, now)?;
    }
    tx.commit()?;

    Ok(GroupRow {
        group_id,
        creator_id: creator_id.to_string(),
        title: title.to_string(),
        created_at: now,
    })
}

/// Add members to an existing group. Returns how many were new.
/// All-or-nothing, like `create_group`.
pub fn add_group_members(
    storage: &Storage,
    group_id: &str,
    user_ids: &[String],
) -> Result<usize, StorageError> {
    let tx = storage.begin_immediate()?;
    if !is_group(&tx, group_id)? {
        return Err(StorageError::NotFound(format!("group {group_id}")));
    }
    let now = now_secs_f64();
    let mut added = 0;
    for user_id in user_ids {
        if insert_member(&tx, group_id, user_id, false, now)? {
            added += 1;
        }
    }
    tx.commit()?;
    Ok(added)
}

/// Change a group's title. Returns false when the group does not exist.
pub fn rename_group(conn: &Connection, group_id: &str, title: &str) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "UPDATE group_list SET title = ?1, updated_at = ?2 WHERE chat_id = ?3",
        params![title, now_secs_f64(), group_id],
    )?;
    Ok(affected > 0)
}

/// Current members with their admin flag and profile name, ordered by user.
pub fn list_participants(conn: &Connection, group_id: &str) -> Result<Vec<Participant>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT c.user_id, c.is_admin, p.name
         FROM chat_list c LEFT JOIN profiles p ON p.user_id = c.user_id
         WHERE c.chat_id = ?1 AND c.chat_type = ?2
         ORDER BY c.user_id",
    )?;
    let rows = stmt.query_map(params![group_id, ChatType::Group.as_i64()], |row| {
        Ok(Participant {
            user_id: row.get(0)?,
            is_admin: row.get::<_, i64>(1)? != 0,
            name: row.get(2)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn remove_group_member(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "DELETE FROM chat_list WHERE user_id = ?1 AND chat_id = ?2 AND chat_type = ?3",
        params![user_id, group_id, ChatType::Group.as_i64()],
    )?;
    Ok(affected > 0)
}

pub fn remove_admin_role(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "UPDATE chat_list SET is_admin = 0
         WHERE is_admin = 1 AND user_id = ?1 AND chat_id = ?2",
        params![user_id, group_id],
    )?;
    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ProfileRow;

    fn verified(storage: &Storage, user: &str, device: &str) {
        storage
            .upsert_device(user, device, DeviceState::Verified)
            .unwrap();
    }

    #[test]
    fn unknown_identifier_resolves_to_individual_with_verified_devices_only() {
        let storage = Storage::open_in_memory().unwrap();
        verified(&storage, "bob", "bob-2");
        verified(&storage, "bob", "bob-1");
        storage
            .upsert_device("bob", "bob-3", DeviceState::Pending)
            .unwrap();

        let resolved = resolve(storage.connection(), "bob").unwrap();
        assert_eq!(
            resolved,
            Recipient::Individual {
                user_id: "bob".to_string(),
                device_ids: vec!["bob-1".to_string(), "bob-2".to_string()],
            }
        );
    }

    #[test]
    fn individual_without_devices_is_not_an_error() {
        let storage = Storage::open_in_memory().unwrap();
        match resolve(storage.connection(), "nobody").unwrap() {
            Recipient::Individual { device_ids, .. } => assert!(device_ids.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn group_members_follow_current_membership() {
        let storage = Storage::open_in_memory().unwrap();
        let group = create_group(
            &storage,
            "alice",
            "friends",
            &["bob".to_string(), "carol".to_string(), "alice".to_string()],
        )
        .unwrap();
        let conn = storage.connection();

        assert!(is_group_admin(conn, "alice", &group.group_id).unwrap());
        assert!(!is_group_admin(conn, "bob", &group.group_id).unwrap());

        assert!(remove_group_member(conn, &group.group_id, "carol").unwrap());
        assert_eq!(
            add_group_members(&storage, &group.group_id, &["dave".to_string(), "bob".to_string()])
                .unwrap(),
            1
        );

        match resolve(conn, &group.group_id).unwrap() {
            Recipient::Group { member_ids, .. } => {
                assert_eq!(member_ids, vec!["alice", "bob", "dave"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn admin_role_can_be_removed_once() {
        let storage = Storage::open_in_memory().unwrap();
        let group = create_group(&storage, "alice", "g", &[]).unwrap();
        let conn = storage.connection();
        assert!(remove_admin_role(conn, &group.group_id, "alice").unwrap());
        assert!(!remove_admin_role(conn, &group.group_id, "alice").unwrap());
        assert!(is_group_member(conn, "alice", &group.group_id).unwrap());
    }

    #[test]
    fn adding_to_missing_group_fails() {
        let storage = Storage::open_in_memory().unwrap();
        let err = add_group_members(&storage, "missing", &["bob".to_string()]).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(list_participants(storage.connection(), "missing")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rename_changes_title_of_existing_group_only() {
        let storage = Storage::open_in_memory().unwrap();
        let group = create_group(&storage, "alice", "old", &[]).unwrap();
        let conn = storage.connection();

        assert!(rename_group(conn, &group.group_id, "new").unwrap());
        assert_eq!(get_group(conn, &group.group_id).unwrap().unwrap().title, "new");
        assert!(!rename_group(conn, "missing", "new").unwrap());
    }

    #[test]
    fn participants_carry_admin_flag_and_profile_name() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_profile(&ProfileRow {
                user_id: "bob".to_string(),
                name: Some("Bob".to_string()),
                phone_number: None,
            })
            .unwrap();
        let group = create_group(&storage, "alice", "g", &["bob".to_string()]).unwrap();
        let conn = storage.connection();

        assert!(is_group_member(conn, "bob", &group.group_id).unwrap());
        assert!(!is_group_member(conn, "carol", &group.group_id).unwrap());
        assert_eq!(
            list_participants(conn, &group.group_id).unwrap(),
            vec![
                Participant {
                    user_id: "alice".to_string(),
                    is_admin: true,
                    name: None,
                },
                Participant {
                    user_id: "bob".to_string(),
                    is_admin: false,
                    name: Some("Bob".to_string()),
                },
            ]
        );
    }
}
