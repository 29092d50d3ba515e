//! Notifications published on a queue's channel
//!
//! A live connection subscribes to its queue and re-reads it whenever an
//! event arrives. Only one reader per queue is live: each new subscriber
//! announces itself with [`QueueEvent::Displaced`] and then closes every
//! older subscription.

use courier_cache::Subscription;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{QueueKey, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    /// At least one envelope was appended
    NewMessages,
    /// Envelopes moved to durable storage; re-read from there
    MessagesPersisted,
    /// A newer subscriber took over the queue
    Displaced { by: Ulid },
}

impl QueueEvent {
    pub(crate) const fn kind(self) -> &'static str {
        match self {
            Self::NewMessages => "new_messages",
            Self::MessagesPersisted => "messages_persisted",
            Self::Displaced { .. } => "displaced",
        }
    }

    pub(crate) fn to_bytes(self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(event)
    }
}

/// A live subscription to one queue's events
#[derive(Debug)]
pub struct QueueSubscription {
    key: QueueKey,
    id: Ulid,
    inner: Subscription,
}

impl QueueSubscription {
    pub(crate) const fn new(key: QueueKey, id: Ulid, inner: Subscription) -> Self {
        Self { key, id, inner }
    }

    pub const fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Id this subscriber announced itself with
    pub const fn id(&self) -> Ulid {
        self.id
    }

    /// Wait for the next event. Returns `None` once the subscription has
    /// been closed, which happens when a newer subscriber took over.
    ///
    /// After receiving [`QueueEvent::Displaced`] or `None` the caller should
    /// drop the subscription and close its connection.
    pub async fn next(&mut self) -> Option<QueueEvent> {
        loop {
            let payload = self.inner.recv().await?;

            match QueueEvent::from_bytes(&payload) {
                Ok(event) => return Some(event),
                Err(err) => {
                    tracing::warn!(queue = %self.key, error = %err, "Ignoring unreadable queue event");
                }
            }
        }
    }
}
