//! The unit of mail

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::Result;

/// Server-assigned unique id of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageGuid(Ulid);

impl MessageGuid {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for MessageGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MessageGuid {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Kind of payload carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[default]
    Unknown,
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
    PlaintextContent,
}

/// An immutable message destined for one device
///
/// `server_guid` and `server_timestamp` belong to the server: whatever a
/// producer puts there is replaced when the envelope is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub server_guid: MessageGuid,
    pub kind: EnvelopeType,
    pub source_identity: Option<String>,
    pub source_device: Option<u32>,
    /// Client supplied, milliseconds since the epoch; untrusted
    pub timestamp: u64,
    /// Milliseconds since the epoch, assigned when queued
    pub server_timestamp: u64,
    pub content: Vec<u8>,
    /// Only meaningful to a live connection; never persisted
    pub ephemeral: bool,
    pub urgent: bool,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: EnvelopeType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            server_guid: MessageGuid::generate(),
            kind,
            source_identity: None,
            source_device: None,
            timestamp: 0,
            server_timestamp: 0,
            content: content.into(),
            ephemeral: false,
            urgent: false,
        }
    }

    #[must_use]
    pub fn with_source(mut self, identity: impl Into<String>, device: u32) -> Self {
        self.source_identity = Some(identity.into());
        self.source_device = Some(device);
        self
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub const fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    #[must_use]
    pub const fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Wire form stored in the cache
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// # Errors
    ///
    /// Returns an error if `bytes` is not an encoded envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (envelope, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(envelope)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_text_form() {
        let guid = MessageGuid::generate();
        let parsed: MessageGuid = guid.to_string().parse().unwrap();
        assert_eq!(parsed, guid);
        assert!("not-a-guid".parse::<MessageGuid>().is_err());
    }

    #[test]
    fn test_builder() {
        let envelope = Envelope::new(EnvelopeType::Ciphertext, b"hello".as_slice())
            .with_source("alice", 2)
            .with_timestamp(42)
            .urgent();

        assert_eq!(envelope.source_identity.as_deref(), Some("alice"));
        assert_eq!(envelope.source_device, Some(2));
        assert_eq!(envelope.timestamp, 42);
        assert!(envelope.urgent);
        assert!(!envelope.ephemeral);
    }

    #[test]
    fn test_truncated_bytes_are_rejected() {
        let bytes = Envelope::new(EnvelopeType::Receipt, vec![1, 2, 3])
            .to_bytes()
            .unwrap();
        assert!(Envelope::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
