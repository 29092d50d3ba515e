//! Mapping of keys onto the fixed partition space.
//!
//! Keys hash with CRC16/XMODEM into [`PARTITION_COUNT`] partitions, the same
//! scheme cluster-mode key-value stores use to assign key slots. If the key
//! contains a non-empty `{...}` section only that section is hashed, which
//! lets every key belonging to one queue share a partition.

use serde::{Deserialize, Serialize};

/// Number of partitions in the key space. Always a power of two.
pub const PARTITION_COUNT: u16 = 16384;

/// One slice of the hashed key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition(u16);

impl Partition {
    /// Returns `None` if `index` is outside `[0, PARTITION_COUNT)`
    #[must_use]
    pub const fn new(index: u16) -> Option<Self> {
        if index < PARTITION_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Partition for an ever-increasing counter value, wrapping around the space
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "The value is reduced modulo PARTITION_COUNT first"
    )]
    pub const fn from_counter(counter: u64) -> Self {
        Self((counter % PARTITION_COUNT as u64) as u16)
    }

    #[must_use]
    pub const fn index(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self((self.0 + 1) % PARTITION_COUNT)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The partition owning `key`
#[must_use]
pub fn key_slot(key: &str) -> Partition {
    let bytes = key.as_bytes();

    let hashed = bytes
        .iter()
        .position(|&b| b == b'{')
        .and_then(|open| {
            bytes[open + 1..]
                .iter()
                .position(|&b| b == b'}')
                .filter(|&len| len > 0)
                .map(|len| &bytes[open + 1..open + 1 + len])
        })
        .unwrap_or(bytes);

    Partition(crc16(hashed) % PARTITION_COUNT)
}

fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &byte| {
        (0..8).fold(crc ^ (u16::from(byte) << 8), |crc, _| {
            if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            }
        })
    })
}
