//! Validation identifier derivation.
//!
//! A permission is identified by 4 bytes derived from the (kernel, delegate)
//! pair; the kernel addresses its validator storage with a 21-byte validation
//! id whose leading byte tags the validator type.

use core::fmt;

use alloy_primitives::{keccak256, Address, FixedBytes};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};

/// Validation type tag for permission validators.
pub const VALIDATION_TYPE_PERMISSION: u8 = 0x02;

/// 4-byte permission identifier, unique per (kernel, delegate) pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PermissionId(pub FixedBytes<4>);

impl PermissionId {
    /// The raw 4 bytes.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0 .0
    }
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 21-byte validation id: type tag ++ permission id ++ 16 zero bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ValidationId(FixedBytes<21>);

impl ValidationId {
    /// Builds the validation id for a permission.
    pub fn from_permission(id: PermissionId) -> Self {
        let mut bytes = [0u8; 21];
        bytes[0] = VALIDATION_TYPE_PERMISSION;
        bytes[1..5].copy_from_slice(id.as_bytes());
        Self(FixedBytes(bytes))
    }

    /// The leading validator-type byte.
    pub const fn type_tag(&self) -> u8 {
        self.0 .0[0]
    }

    /// The embedded 4-byte permission id.
    pub fn permission_id(&self) -> PermissionId {
        PermissionId(FixedBytes::from_slice(&self.0 .0[1..5]))
    }

    /// The underlying 21 bytes.
    pub const fn into_inner(self) -> FixedBytes<21> {
        self.0
    }
}

impl fmt::Display for ValidationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives the 4-byte permission id for a (kernel, delegate) pair:
/// the first 4 bytes of `keccak256(abi.encode(kernel, delegate))`.
pub fn permission_id(kernel: Address, delegate: Address) -> PermissionId {
    let digest = keccak256((kernel, delegate).abi_encode());
    PermissionId(FixedBytes::from_slice(&digest[..4]))
}

/// The 20-byte nonce-lane identifier for a permission: the permission id
/// followed by 16 zero bytes. Lane nonces correlate with a validation id
/// irrespective of its type tag.
pub fn identifier_without_type(id: PermissionId) -> Address {
    let mut bytes = [0u8; 20];
    bytes[..4].copy_from_slice(id.as_bytes());
    Address::from(bytes)
}
