//! Session token resolution.
//!
//! Tokens are opaque strings issued by the verification flow. The session
//! store maps `UID-<token>` to a user ID and `DEV-<token>` to a device ID;
//! entries carry no expiry.

use rand::RngCore;

use crate::error::DeliveryError;
use crate::storage::{Storage, StorageError};

const USER_KEY_PREFIX: &str = "UID-";
const DEVICE_KEY_PREFIX: &str = "DEV-";
const TOKEN_BYTES: usize = 32;

/// Key-value lookup the resolver runs against.
pub trait SessionStore {
    fn lookup(&self, key: &str) -> Result<Option<String>, StorageError>;
}

impl SessionStore for Storage {
    fn lookup(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.get_session_key(key)
    }
}

/// The (user, device) pair a token stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
}

fn lookup_non_empty(
    store: &impl SessionStore,
    prefix: &str,
    token: &str,
) -> Result<String, DeliveryError> {
    if token.is_empty() {
        return Err(DeliveryError::InvalidSession);
    }
    match store.lookup(&format!("{prefix}{token}"))? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DeliveryError::InvalidSession),
    }
}

pub fn resolve_user(store: &impl SessionStore, token: &str) -> Result<String, DeliveryError> {
    lookup_non_empty(store, USER_KEY_PREFIX, token)
}

pub fn resolve_device(store: &impl SessionStore, token: &str) -> Result<String, DeliveryError> {
    lookup_non_empty(store, DEVICE_KEY_PREFIX, token)
}

/// Resolve both halves of a session. Fails if either is missing.
pub fn resolve(store: &impl SessionStore, token: &str) -> Result<Session, DeliveryError> {
    Ok(Session {
        user_id: resolve_user(store, token)?,
        device_id: resolve_device(store, token)?,
    })
}

/// Mint a token for an already verified device and record both keys.
///
/// Token issuance belongs to the verification flow; this exists for
/// provisioning (`courier seed`) and tests.
pub fn issue_session(
    storage: &Storage,
    user_id: &str,
    device_id: &str,
) -> Result<String, StorageError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    storage.put_session_key(&format!("{USER_KEY_PREFIX}{token}"), user_id)?;
    storage.put_session_key(&format!("{DEVICE_KEY_PREFIX}{token}"), device_id)?;
    Ok(token)
}

pub fn revoke_session(storage: &Storage, token: &str) -> Result<bool, StorageError> {
    let user = storage.delete_session_key(&format!("{USER_KEY_PREFIX}{token}"))?;
    let device = storage.delete_session_key(&format!("{DEVICE_KEY_PREFIX}{token}"))?;
    Ok(user || device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_session_resolves_to_user_and_device() {
        let storage = Storage::open_in_memory().unwrap();
        let token = issue_session(&storage, "user-a", "device-a").unwrap();
        assert_eq!(token.len(), TOKEN_BYTES * 2);

        let session = resolve(&storage, &token).unwrap();
        assert_eq!(
            session,
            Session {
                user_id: "user-a".to_string(),
                device_id: "device-a".to_string(),
            }
        );
    }

    #[test]
    fn unknown_empty_and_revoked_tokens_are_invalid() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(matches!(
            resolve_user(&storage, "nope"),
            Err(DeliveryError::InvalidSession)
        ));
        assert!(matches!(
            resolve_device(&storage, ""),
            Err(DeliveryError::InvalidSession)
        ));

        storage.put_session_key("UID-blank", "").unwrap();
        assert!(matches!(
            resolve_user(&storage, "blank"),
            Err(DeliveryError::InvalidSession)
        ));

        let token = issue_session(&storage, "user-a", "device-a").unwrap();
        assert!(revoke_session(&storage, &token).unwrap());
        assert!(matches!(
            resolve(&storage, &token),
            Err(DeliveryError::InvalidSession)
        ));
    }

    #[test]
    fn half_a_session_is_not_a_session() {
        let storage = Storage::open_in_memory().unwrap();
        storage.put_session_key("UID-half", "user-a").unwrap();
        assert_eq!(resolve_user(&storage, "half").unwrap(), "user-a");
        assert!(matches!(
            resolve(&storage, "half"),
            Err(DeliveryError::InvalidSession)
        ));
    }
}
