//! Nonce-lane key construction and lane serialization.
//!
//! A kernel nonce is a 256-bit value: a 192-bit lane key (mode | validator
//! type | 20-byte identifier | sequence key) shifted left 64 bits, OR-ed with
//! a per-lane 64-bit sequence. Lanes order operations independently per
//! validator, so two lanes never contend for the same sequence.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, FixedBytes, U256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::identifiers::{identifier_without_type, PermissionId};

/// Default nonce mode.
pub const NONCE_MODE_DEFAULT: u8 = 0x00;
/// Enable mode: the operation carries an enable-signature payload.
pub const NONCE_MODE_ENABLE: u8 = 0x01;

/// Root validator type.
pub const NONCE_TYPE_ROOT: u8 = 0x00;
/// Permission validator type.
pub const NONCE_TYPE_PERMISSION: u8 = 0x02;

/// A 192-bit nonce-lane key: mode (1B) | type (1B) | identifier (20B) |
/// sequence key (2B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NonceKey(FixedBytes<24>);

impl NonceKey {
    /// The all-zero root lane. Root operations bypass the general encoder and
    /// always use identifier zero; verified against the deployed validator's
    /// nonce semantics rather than assumed.
    pub const ROOT: Self = Self(FixedBytes::ZERO);

    /// Packs a lane key from its fields.
    pub fn encode(mode: u8, vtype: u8, identifier: Address, sequence_key: u16) -> Self {
        let mut bytes = [0u8; 24];
        bytes[0] = mode;
        bytes[1] = vtype;
        bytes[2..22].copy_from_slice(identifier.as_slice());
        bytes[22..24].copy_from_slice(&sequence_key.to_be_bytes());
        Self(FixedBytes(bytes))
    }

    /// Unpacks a lane key into (mode, type, identifier, sequence key).
    pub fn decode(&self) -> (u8, u8, Address, u16) {
        let bytes = self.0 .0;
        let identifier = Address::from_slice(&bytes[2..22]);
        let sequence_key = u16::from_be_bytes([bytes[22], bytes[23]]);
        (bytes[0], bytes[1], identifier, sequence_key)
    }

    /// The default-mode lane for permission-lane sends.
    pub fn permission_default(id: PermissionId) -> Self {
        Self::encode(NONCE_MODE_DEFAULT, NONCE_TYPE_PERMISSION, identifier_without_type(id), 0)
    }

    /// The enable-mode lane for operations carrying an enable signature.
    pub fn permission_enable(id: PermissionId) -> Self {
        Self::encode(NONCE_MODE_ENABLE, NONCE_TYPE_PERMISSION, identifier_without_type(id), 0)
    }

    /// The raw 24 bytes.
    pub const fn as_bytes(&self) -> &[u8; 24] {
        &self.0 .0
    }
}

/// Combines a lane key and a 64-bit sequence into the full 256-bit nonce.
pub fn encode_nonce(key: NonceKey, sequence: u64) -> U256 {
    (U256::from_be_slice(key.as_bytes()) << 64usize) | U256::from(sequence)
}

/// Splits a full nonce into its lane key and sequence.
pub fn decode_nonce(nonce: U256) -> (NonceKey, u64) {
    let sequence = (nonce & U256::from(u64::MAX)).to::<u64>();
    let key_bits = nonce >> 64usize;
    let bytes = key_bits.to_be_bytes::<32>();
    (NonceKey(FixedBytes::from_slice(&bytes[8..32])), sequence)
}

/// Serializes fetch-nonce-then-submit sequences per (account, lane).
///
/// A lane sequence is fetched then consumed; two concurrent fetch-then-submit
/// flows on the same lane would collide on the same sequence value. Callers
/// hold the returned guard from nonce resolution through submission.
#[derive(Debug, Default)]
pub struct LaneLocks {
    lanes: Mutex<HashMap<(Address, NonceKey), Arc<Mutex<()>>>>,
}

impl LaneLocks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for one (account, lane) pair. Lanes nobody holds or
    /// waits on are dropped from the registry on the way, keeping it bounded
    /// by the number of in-flight lanes.
    pub async fn acquire(&self, account: Address, key: NonceKey) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().await;
            let lane = Arc::clone(lanes.entry((account, key)).or_default());
            // Guards and waiters each hold a clone; a count of one means the
            // map is the only owner left.
            lanes.retain(|_, l| Arc::strong_count(l) > 1);
            lane
        };
        lane.lock_owned().await
    }
}
