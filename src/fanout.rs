//! Fanout: one logical message in, one mailbox row per target device out.
//!
//! Every attempt runs inside a single IMMEDIATE transaction: resolve the
//! recipient, enqueue each leg, upsert conversation summaries, commit. Only
//! after the commit are live devices woken and the rest handed to the push
//! gateway, so nobody is ever woken for a row that was rolled back.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clog;
use crate::conversations::{self, ChatType, SummaryUpdate};
use crate::error::DeliveryError;
use crate::identity::Session;
use crate::logging;
use crate::mailbox::{self, MailboxEntry};
use crate::membership::{self, Recipient};
use crate::presence::PresenceRegistry;
use crate::push::{PushData, PushGateway, PushNotification, CLICK_ACTION};
use crate::storage::{now_secs_f64, Storage};

/// Milliseconds between the Unix epoch and the message-ID epoch
/// (2000-01-01, as used by existing clients).
pub const MESSAGE_ID_EPOCH_MS: i64 = 946_659_600_000;

// ---------------------------------------------------------------------------
// Request and response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Regular,
    /// Synthetic control message such as a reception receipt. Never touches
    /// conversation summaries and pushes data-only notifications.
    Management,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionStatus {
    Received,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutMessage {
    pub recipient_id: String,
    pub contents: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutMessageState {
    pub chat_id: String,
    pub message_id: i64,
    pub status: ReceptionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PutMessageReceipt {
    pub message_id: i64,
    pub message_timestamp: f64,
}

/// Body of the management message a receipt turns into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementMessage {
    pub message_type: String,
    pub text: String,
    pub command: ReceptionCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceptionCommand {
    #[serde(rename = "type")]
    pub status: ReceptionStatus,
    pub message_id: i64,
}

impl ManagementMessage {
    pub fn reception_receipt(status: ReceptionStatus, message_id: i64) -> Self {
        Self {
            message_type: "management".to_string(),
            text: "reception-receipt".to_string(),
            command: ReceptionCommand { status, message_id },
        }
    }
}

// ---------------------------------------------------------------------------
// Message IDs
// ---------------------------------------------------------------------------

/// Source of message IDs. IDs are sortable but not unique; collisions are
/// caught by the mailbox primary key.
pub trait MessageIdSource: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Wall-clock milliseconds since [`MESSAGE_ID_EPOCH_MS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMessageIds;

impl MessageIdSource for SystemMessageIds {
    fn next_id(&self) -> i64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        now_ms - MESSAGE_ID_EPOCH_MS
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retry the whole fanout with a fresh ID on a write conflict.
    pub retry_on_conflict: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Surface the first conflict to the caller.
    pub fn surface() -> Self {
        Self {
            retry_on_conflict: false,
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            retry_on_conflict: true,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanoutPolicy {
    /// Update the sender's own summary even when a direct message reached
    /// no device.
    pub summary_without_delivery: bool,
    /// Applied to ordinary message sends.
    pub message_retry: RetryPolicy,
    /// Applied to receipts.
    pub receipt_retry: RetryPolicy,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            summary_without_delivery: false,
            message_retry: RetryPolicy::surface(),
            receipt_retry: RetryPolicy::bounded(5, Duration::from_millis(100)),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanoutState {
    Resolving,
    Writing,
    Committing,
    Done,
    Failed,
}

impl std::fmt::Display for FanoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FanoutState::Resolving => "resolving",
            FanoutState::Writing => "writing",
            FanoutState::Committing => "committing",
            FanoutState::Done => "done",
            FanoutState::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn log_state(message_id: i64, state: FanoutState) {
    clog!("fanout: {} {}", logging::msg_id(message_id), state);
}

/// A device that received a row in a committed fanout.
#[derive(Debug, Clone)]
struct Leg {
    user_id: String,
    device_id: String,
    push: Option<PushNotification>,
}

/// Outcome of one committed fanout.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub timestamp: f64,
    pub to_group: bool,
    pub legs: usize,
}

#[derive(Clone)]
pub struct FanoutEngine {
    store: Arc<Mutex<Storage>>,
    presence: PresenceRegistry,
    push: Arc<dyn PushGateway>,
    ids: Arc<dyn MessageIdSource>,
    policy: FanoutPolicy,
}

impl FanoutEngine {
    pub fn new(
        store: Arc<Mutex<Storage>>,
        presence: PresenceRegistry,
        push: Arc<dyn PushGateway>,
        policy: FanoutPolicy,
    ) -> Self {
        Self {
            store,
            presence,
            push,
            ids: Arc::new(SystemMessageIds),
            policy,
        }
    }

    pub fn with_id_source(mut self, ids: Arc<dyn MessageIdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Send a message. A write conflict is returned as-is unless the
    /// message retry policy says otherwise.
    pub async fn put_message(
        &self,
        session: &Session,
        request: PutMessage,
    ) -> Result<PutMessageReceipt, DeliveryError> {
        let delivery = self
            .deliver(session, &request, self.policy.message_retry)
            .await?;
        Ok(PutMessageReceipt {
            message_id: delivery.message_id,
            message_timestamp: delivery.timestamp,
        })
    }

    /// Report a reception state back into a chat as a management message.
    /// Conflicts are retried with a fresh message ID. A non-group chat with
    /// no verified device fails with `RecipientNotFound`.
    pub async fn put_message_state(
        &self,
        session: &Session,
        request: PutMessageState,
    ) -> Result<Delivery, DeliveryError> {
        clog!(
            "fanout: receipt {:?} for {} from {}",
            request.status,
            logging::msg_id(request.message_id),
            logging::user_id(&session.user_id)
        );
        let contents = serde_json::to_string(&ManagementMessage::reception_receipt(
            request.status,
            request.message_id,
        ))
        .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;
        let message = PutMessage {
            recipient_id: request.chat_id,
            contents,
            excerpt: String::new(),
            encrypted: false,
            kind: MessageKind::Management,
        };

        let delivery = self
            .deliver(session, &message, self.policy.receipt_retry)
            .await?;
        if delivery.legs == 0 && !delivery.to_group {
            return Err(DeliveryError::RecipientNotFound(message.recipient_id));
        }
        Ok(delivery)
    }

    /// Drain every queued entry for a device.
    pub async fn get_messages(&self, device_id: &str) -> Result<Vec<MailboxEntry>, DeliveryError> {
        let storage = self.store.lock().await;
        let entries = mailbox::dequeue_all(storage.connection(), device_id)?;
        clog!(
            "mailbox: drained {} entr(ies) for {}",
            entries.len(),
            logging::device_id(device_id)
        );
        Ok(entries)
    }

    async fn deliver(
        &self,
        session: &Session,
        request: &PutMessage,
        retry: RetryPolicy,
    ) -> Result<Delivery, DeliveryError> {
        if request.recipient_id.trim().is_empty() {
            return Err(DeliveryError::InvalidRequest(
                "recipient_id must not be empty".to_string(),
            ));
        }
        if request.encrypted {
            return Err(DeliveryError::NotImplemented("encrypted message delivery"));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let message_id = self.ids.next_id();
            match self.attempt(session, request, message_id).await {
                Ok((delivery, legs)) => {
                    self.notify(session, request, &delivery, legs);
                    return Ok(delivery);
                }
                Err(err) => match err.conflict() {
                    Some(kind) if retry.retry_on_conflict => {
                        if attempts >= retry.max_attempts {
                            clog!(
                                "fanout: giving up after {} attempt(s): {}",
                                attempts,
                                kind
                            );
                            return Err(DeliveryError::RetriesExhausted {
                                attempts,
                                last: kind,
                            });
                        }
                        clog!(
                            "fanout: {} conflicted ({}), retrying",
                            logging::msg_id(message_id),
                            kind
                        );
                        tokio::time::sleep(retry.delay).await;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    async fn attempt(
        &self,
        session: &Session,
        request: &PutMessage,
        message_id: i64,
    ) -> Result<(Delivery, Vec<Leg>), DeliveryError> {
        let storage = self.store.lock().await;
        let result = self.write(&storage, session, request, message_id);
        match &result {
            Ok(_) => log_state(message_id, FanoutState::Done),
            Err(err) => {
                log_state(message_id, FanoutState::Failed);
                clog!("fanout: {} {}", logging::msg_id(message_id), err);
            }
        }
        let (delivery, mut legs) = result?;

        // Push payloads are prepared under the lock; sending happens later.
        for leg in &mut legs {
            leg.push = self.prepare_push(&storage, session, request, &delivery, leg);
        }
        Ok((delivery, legs))
    }

    fn write(
        &self,
        storage: &Storage,
        session: &Session,
        request: &PutMessage,
        message_id: i64,
    ) -> Result<(Delivery, Vec<Leg>), DeliveryError> {
        let timestamp = now_secs_f64();
        let tx = storage.begin_immediate()?;

        log_state(message_id, FanoutState::Resolving);
        let recipient = membership::resolve(&tx, &request.recipient_id)?;

        log_state(message_id, FanoutState::Writing);
        let regular = request.kind == MessageKind::Regular;
        let template = MailboxEntry {
            recipient_id: request.recipient_id.clone(),
            message_id,
            sender_id: session.user_id.clone(),
            sender_device_id: session.device_id.clone(),
            recipient_device_id: String::new(),
            timestamp,
            contents: request.contents.clone(),
            encrypted: request.encrypted,
        };
        let summary = |owner_id: &str, chat_id: &str, chat_type: ChatType| {
            conversations::upsert(
                &tx,
                &SummaryUpdate {
                    owner_id,
                    chat_id,
                    excerpt: &request.excerpt,
                    chat_type,
                    timestamp,
                },
            )
        };

        let mut legs = Vec::new();
        let to_group = match &recipient {
            Recipient::Individual {
                user_id,
                device_ids,
            } => {
                for device_id in device_ids {
                    enqueue_leg(&tx, &template, user_id, device_id, &mut legs)?;
                }
                if device_ids.is_empty() {
                    clog!(
                        "fanout: no verified devices for {}",
                        logging::user_id(user_id)
                    );
                }
                if regular && !device_ids.is_empty() {
                    summary(user_id, &session.user_id, ChatType::Direct)?;
                    summary(&session.user_id, user_id, ChatType::Direct)?;
                } else if regular && self.policy.summary_without_delivery {
                    summary(&session.user_id, user_id, ChatType::Direct)?;
                }
                false
            }
            Recipient::Group {
                group_id,
                member_ids,
            } => {
                for member_id in member_ids {
                    let device_ids = membership::list_verified_devices(&tx, member_id)?;
                    for device_id in &device_ids {
                        enqueue_leg(&tx, &template, member_id, device_id, &mut legs)?;
                    }
                    if regular && !device_ids.is_empty() {
                        summary(member_id, group_id, ChatType::Group)?;
                    }
                }
                true
            }
        };

        log_state(message_id, FanoutState::Committing);
        tx.commit()?;

        let delivery = Delivery {
            message_id,
            timestamp,
            to_group,
            legs: legs.len(),
        };
        Ok((delivery, legs))
    }

    fn prepare_push(
        &self,
        storage: &Storage,
        session: &Session,
        request: &PutMessage,
        delivery: &Delivery,
        leg: &Leg,
    ) -> Option<PushNotification> {
        let token = match storage.get_push_token(&leg.device_id) {
            Ok(Some(row)) => row.token,
            Ok(None) => return None,
            Err(e) => {
                clog!(
                    "push: token lookup failed for {}: {}",
                    logging::device_id(&leg.device_id),
                    e
                );
                return None;
            }
        };

        let (chat_id, group_id) = if delivery.to_group {
            (request.recipient_id.clone(), Some(request.recipient_id.clone()))
        } else {
            (session.user_id.clone(), None)
        };
        let (title, body) = match request.kind {
            MessageKind::Management => (None, None),
            MessageKind::Regular => {
                let name = storage
                    .display_name(&session.user_id, &leg.user_id)
                    .unwrap_or_default();
                (Some(name), Some(request.excerpt.clone()))
            }
        };

        Some(PushNotification {
            token,
            title,
            body,
            data: PushData {
                chat_id,
                recipient_id: leg.user_id.clone(),
                group_id,
                click_action: CLICK_ACTION.to_string(),
                timestamp: delivery.timestamp,
            },
        })
    }

    /// Wake live devices; push to the rest on a detached task.
    fn notify(&self, session: &Session, request: &PutMessage, delivery: &Delivery, legs: Vec<Leg>) {
        let mut pushes = Vec::new();
        for leg in legs {
            if self.presence.signal(&leg.device_id, delivery.timestamp) {
                continue;
            }
            match leg.push {
                Some(notification) => pushes.push(notification),
                None => clog!(
                    "push: no token for {}, message waits in mailbox",
                    logging::device_id(&leg.device_id)
                ),
            }
        }
        if pushes.is_empty() {
            return;
        }

        clog!(
            "fanout: {} from {} to {}, {} push(es)",
            logging::msg_id(delivery.message_id),
            logging::user_id(&session.user_id),
            logging::chat_id(&request.recipient_id),
            pushes.len()
        );
        let gateway = Arc::clone(&self.push);
        tokio::task::spawn_blocking(move || {
            for notification in pushes {
                if let Err(e) = gateway.push(&notification) {
                    clog!("push: {}", e);
                }
            }
        });
    }
}

fn enqueue_leg(
    conn: &Connection,
    template: &MailboxEntry,
    user_id: &str,
    device_id: &str,
    legs: &mut Vec<Leg>,
) -> Result<(), DeliveryError> {
    let entry = MailboxEntry {
        recipient_device_id: device_id.to_string(),
        ..template.clone()
    };
    mailbox::enqueue(conn, &entry)?;
    legs.push(Leg {
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        push: None,
    });
    Ok(())
}
