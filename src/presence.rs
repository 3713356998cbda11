//! Process-local presence: which devices hold a live notification stream.
//!
//! Each device maps to the sending half of a small wake channel. Registering
//! again replaces the entry and drops the old sender, which is how the old
//! holder learns it has been superseded: its receiver yields `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const WAKE_CHANNEL_CAPACITY: usize = 16;

/// Wake signal sent to a live subscription. Carries no message content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wake {
    pub timestamp: f64,
}

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    Superseded,
    ClientClosed,
}

struct Entry {
    token: u64,
    tx: mpsc::Sender<Wake>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_token: u64,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<Inner>>,
}

/// The holder's side of a registration. Dropping it unregisters, but only
/// if no newer registration has replaced it.
pub struct Subscription {
    device_id: String,
    token: u64,
    rx: mpsc::Receiver<Wake>,
    registry: PresenceRegistry,
}

impl Subscription {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Wait for the next wake. `None` means this subscription was superseded.
    /// Wakes still buffered when a newer registration took over are dropped.
    pub async fn next(&mut self) -> Option<Wake> {
        let wake = self.rx.recv().await?;
        if self.registry.current_token(&self.device_id) != Some(self.token) {
            return None;
        }
        Some(wake)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(&self.device_id, self.token);
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a live stream for `device_id`, replacing any previous one.
    pub fn register(&self, device_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);
        let token = {
            let mut inner = self.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner
                .entries
                .insert(device_id.to_string(), Entry { token, tx });
            token
        };
        Subscription {
            device_id: device_id.to_string(),
            token,
            rx,
            registry: self.clone(),
        }
    }

    /// Best-effort wake. Returns whether the device has a live subscription.
    /// A full channel already holds a pending wake, so it counts as delivered.
    pub fn signal(&self, device_id: &str, timestamp: f64) -> bool {
        let inner = self.lock();
        match inner.entries.get(device_id) {
            Some(entry) => match entry.tx.try_send(Wake { timestamp }) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    fn current_token(&self, device_id: &str) -> Option<u64> {
        self.lock().entries.get(device_id).map(|entry| entry.token)
    }

    /// Remove the registration only if it still belongs to `token`.
    pub fn unregister(&self, device_id: &str, token: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get(device_id) {
            Some(entry) if entry.token == token => {
                inner.entries.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, device_id: &str) -> bool {
        self.lock().entries.contains_key(device_id)
    }

    pub fn live_count(&self) -> usize {
        self.lock().entries.len()
    }
}
