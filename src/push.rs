//! Push-notification fallback for devices without a live stream.
//!
//! Delivery never waits on a push: the fanout engine hands notifications to
//! a gateway on a detached blocking task and only logs the outcome.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::clog;
use crate::logging;

pub const CLICK_ACTION: &str = "FLUTTER_NOTIFICATION_CLICK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    pub chat_id: String,
    pub recipient_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub click_action: String,
    pub timestamp: f64,
}

/// One notification for one device token. Management messages leave both
/// `title` and `body` empty so the client receives a data-only push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub token: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub data: PushData,
}

impl PushNotification {
    pub fn is_data_only(&self) -> bool {
        self.title.is_none() && self.body.is_none()
    }
}

#[derive(Debug)]
pub enum PushError {
    Http(String),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Http(msg) => write!(f, "push gateway error: {msg}"),
            PushError::Serialize(e) => write!(f, "push serialization error: {e}"),
        }
    }
}

impl std::error::Error for PushError {}

impl From<serde_json::Error> for PushError {
    fn from(e: serde_json::Error) -> Self {
        PushError::Serialize(e)
    }
}

/// Anything that can deliver a push notification. Called from a blocking
/// context; implementations may do synchronous I/O.
pub trait PushGateway: Send + Sync {
    fn push(&self, notification: &PushNotification) -> Result<(), PushError>;
}

/// Writes notifications to the log and drops them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushGateway;

impl PushGateway for LogPushGateway {
    fn push(&self, notification: &PushNotification) -> Result<(), PushError> {
        clog!(
            "push: {} for {} ({})",
            if notification.is_data_only() { "data-only" } else { "notification" },
            logging::user_id(&notification.data.recipient_id),
            logging::chat_id(&notification.data.chat_id),
        );
        Ok(())
    }
}

/// POSTs `{"message": {token, notification, data}}` to a gateway URL.
pub struct HttpPushGateway {
    url: String,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    title: &'a str,
    body: &'a str,
}

/// The gateway's `data` map only carries string values.
#[derive(Serialize)]
struct WireData<'a> {
    chat_id: &'a str,
    recipient_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<&'a str>,
    click_action: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification: Option<WireNotification<'a>>,
    data: WireData<'a>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    message: WireMessage<'a>,
}

impl HttpPushGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn envelope(notification: &PushNotification) -> Result<serde_json::Value, PushError> {
        let wire = WireEnvelope {
            message: WireMessage {
                token: &notification.token,
                notification: if notification.is_data_only() {
                    None
                } else {
                    Some(WireNotification {
                        title: notification.title.as_deref().unwrap_or_default(),
                        body: notification.body.as_deref().unwrap_or_default(),
                    })
                },
                data: WireData {
                    chat_id: &notification.data.chat_id,
                    recipient_id: &notification.data.recipient_id,
                    group_id: notification.data.group_id.as_deref(),
                    click_action: &notification.data.click_action,
                    timestamp: notification.data.timestamp.to_string(),
                },
            },
        };
        Ok(serde_json::to_value(wire)?)
    }
}

impl PushGateway for HttpPushGateway {
    fn push(&self, notification: &PushNotification) -> Result<(), PushError> {
        let body = Self::envelope(notification)?;
        match ureq::post(&self.url).send_json(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                Err(PushError::Http(format!("gateway returned {code}")))
            }
            Err(err) => Err(PushError::Http(err.to_string())),
        }
    }
}

/// Keeps every notification in memory for tests.
#[derive(Clone, Default)]
pub struct RecordingPushGateway {
    sent: Arc<Mutex<Vec<PushNotification>>>,
}

impl RecordingPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PushGateway for RecordingPushGateway {
    fn push(&self, notification: &PushNotification) -> Result<(), PushError> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(title: Option<&str>) -> PushNotification {
        PushNotification {
            token: "fcm-token".to_string(),
            title: title.map(str::to_string),
            body: title.map(|_| "hi".to_string()),
            data: PushData {
                chat_id: "alice".to_string(),
                recipient_id: "bob".to_string(),
                group_id: None,
                click_action: CLICK_ACTION.to_string(),
                timestamp: 10.5,
            },
        }
    }

    #[test]
    fn wire_envelope_carries_notification_and_data() {
        let value = HttpPushGateway::envelope(&notification(Some("Alice"))).unwrap();
        assert_eq!(value["message"]["token"], "fcm-token");
        assert_eq!(value["message"]["notification"]["title"], "Alice");
        assert_eq!(value["message"]["notification"]["body"], "hi");
        assert_eq!(value["message"]["data"]["click_action"], CLICK_ACTION);
        assert!(value["message"]["data"].get("group_id").is_none());
    }

    #[test]
    fn wire_data_values_are_all_strings() {
        let mut n = notification(Some("Alice"));
        n.data.group_id = Some("group-1".to_string());
        let value = HttpPushGateway::envelope(&n).unwrap();
        let data = value["message"]["data"].as_object().unwrap();
        assert_eq!(data["timestamp"], "10.5");
        assert_eq!(data["group_id"], "group-1");
        assert!(data.values().all(|v| v.is_string()));
    }

    #[test]
    fn data_only_push_has_no_notification_block() {
        let n = notification(None);
        assert!(n.is_data_only());
        let value = HttpPushGateway::envelope(&n).unwrap();
        assert!(value["message"].get("notification").is_none());
    }

    #[test]
    fn unreachable_gateway_reports_http_error() {
        let gateway = HttpPushGateway::new("http://127.0.0.1:9/push");
        let err = gateway.push(&notification(Some("Alice"))).unwrap_err();
        assert!(matches!(err, PushError::Http(_)));
    }

    #[test]
    fn recording_gateway_keeps_notifications() {
        let gateway = RecordingPushGateway::new();
        gateway.push(&notification(None)).unwrap();
        assert_eq!(gateway.sent().len(), 1);
        assert!(LogPushGateway.push(&notification(None)).is_ok());
    }
}
