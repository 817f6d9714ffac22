//! Store identity.
//!
//! Stamped once when a store is created and immutable thereafter. Two nodes
//! may only replicate from each other when their store ids match; the id is
//! how a cluster refuses foreign stores.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable identity of a physical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Milliseconds since the epoch at store creation.
    pub creation_time: u64,
    /// Random discriminator minted at store creation.
    pub random_id: u64,
}

impl StoreId {
    /// Encoded size on disk and on the wire.
    pub const ENCODED_LEN: usize = 16;

    /// Mint a fresh identity for a new store.
    pub fn generate() -> StoreId {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        StoreId {
            creation_time,
            random_id: rand::thread_rng().gen(),
        }
    }

    /// Serialize as 16 little-endian bytes (creation time, then random id).
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0..8].copy_from_slice(&self.creation_time.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.random_id.to_le_bytes());
        bytes
    }

    /// Parse the 16-byte encoding produced by [`StoreId::to_bytes`].
    pub fn from_bytes(bytes: &[u8; Self::ENCODED_LEN]) -> StoreId {
        StoreId {
            creation_time: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            random_id: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:016x}", self.creation_time, self.random_id)
    }
}
