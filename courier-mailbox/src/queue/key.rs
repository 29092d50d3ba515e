use std::{fmt, str::FromStr};

use courier_cache::{Partition, key_slot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MailboxError;

const QUEUE_PREFIX: &str = "user_queue::";
const LOCK_PREFIX: &str = "user_queue_persisting::";
const CHANNEL_PREFIX: &str = "user_queue_notify::";

/// Destination of a queue: one device of one account
///
/// Every cache key derived from a queue key carries the same `{hash tag}`, so
/// the queue, its persistence lock and its notification channel share a
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub account: Uuid,
    pub device: u32,
}

impl QueueKey {
    #[must_use]
    pub const fn new(account: Uuid, device: u32) -> Self {
        Self { account, device }
    }

    fn tag(&self) -> String {
        format!("{{{}::{}}}", self.account, self.device)
    }

    /// Name of the queue in the cache
    #[must_use]
    pub fn queue_name(&self) -> String {
        format!("{QUEUE_PREFIX}{}", self.tag())
    }

    #[must_use]
    pub fn lock_key(&self) -> String {
        format!("{LOCK_PREFIX}{}", self.tag())
    }

    #[must_use]
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.tag())
    }

    #[must_use]
    pub fn partition(&self) -> Partition {
        key_slot(&self.queue_name())
    }

    /// Recover the key from a queue name listed in a partition index
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::InvalidQueueName`] for anything not produced by
    /// [`QueueKey::queue_name`].
    pub fn from_queue_name(name: &str) -> Result<Self, MailboxError> {
        let invalid = || MailboxError::InvalidQueueName(name.to_string());

        let tag = name
            .strip_prefix(QUEUE_PREFIX)
            .and_then(|rest| rest.strip_prefix('{'))
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(invalid)?;
        let (account, device) = tag.rsplit_once("::").ok_or_else(invalid)?;

        Ok(Self {
            account: Uuid::parse_str(account).map_err(|_| invalid())?,
            device: device.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.account, self.device)
    }
}

impl FromStr for QueueKey {
    type Err = MailboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_queue_name(s)
    }
}
