//! Typed failures returned by the delivery core.

use crate::storage::{ConflictKind, StorageError};

#[derive(Debug)]
pub enum DeliveryError {
    /// Session token missing or unresolvable.
    InvalidSession,
    /// Malformed request (bad identifier, empty field, ...).
    InvalidRequest(String),
    /// The recipient is not a group and has no verified devices. Only surfaced
    /// by callers that need delivery confirmation.
    RecipientNotFound(String),
    /// Primary-key collision or serialization failure in the fanout transaction.
    WriteConflict(ConflictKind),
    /// Bounded retry gave up.
    RetriesExhausted { attempts: u32, last: ConflictKind },
    NotImplemented(&'static str),
    Forbidden(String),
    Storage(StorageError),
}

impl DeliveryError {
    /// Stable machine-readable name, used in RPC error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::InvalidSession => "invalid_session",
            DeliveryError::InvalidRequest(_) => "invalid_request",
            DeliveryError::RecipientNotFound(_) => "recipient_not_found",
            DeliveryError::WriteConflict(_) => "write_conflict",
            DeliveryError::RetriesExhausted { .. } => "retries_exhausted",
            DeliveryError::NotImplemented(_) => "not_implemented",
            DeliveryError::Forbidden(_) => "forbidden",
            DeliveryError::Storage(_) => "storage",
        }
    }

    /// The conflict behind this error, if it is a retryable one.
    pub fn conflict(&self) -> Option<ConflictKind> {
        match self {
            DeliveryError::WriteConflict(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::InvalidSession => write!(f, "invalid session"),
            DeliveryError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            DeliveryError::RecipientNotFound(id) => {
                write!(f, "no devices found for recipient {id}")
            }
            DeliveryError::WriteConflict(kind) => write!(f, "write conflict: {kind}"),
            DeliveryError::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempt(s), last conflict: {last}")
            }
            DeliveryError::NotImplemented(what) => write!(f, "not implemented: {what}"),
            DeliveryError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            DeliveryError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for DeliveryError {
    fn from(e: StorageError) -> Self {
        match e.conflict_kind() {
            Some(kind) => DeliveryError::WriteConflict(kind),
            None => DeliveryError::Storage(e),
        }
    }
}

impl From<rusqlite::Error> for DeliveryError {
    fn from(e: rusqlite::Error) -> Self {
        DeliveryError::from(StorageError::from(e))
    }
}
