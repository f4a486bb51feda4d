//! EIP-712 enable digest.
//!
//! Enabling a validation mid-operation requires a root signature over a
//! typed digest reproducing the kernel's authorization check. The digest is
//! always signed by the root key, never the delegated key, since it
//! authorizes a capability escalation.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_sol_types::{sol, SolStruct};

use crate::chain::{with_read_retry, KernelChainClient};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::identifiers::ValidationId;

sol! {
    /// The kernel's Enable struct; dynamic `bytes` fields are hashed per
    /// EIP-712 encodeData rules.
    struct Enable {
        bytes21 vId;
        uint32 nonce;
        address hook;
        bytes validatorData;
        bytes hookData;
        bytes selectorData;
    }
}

/// Resolves the config nonce the kernel will check during enable.
///
/// The on-chain rule: when the validator's stored config nonce equals the
/// account's current nonce the enable targets the next installation slot
/// (`current + 1`); otherwise it targets the current one. This mirrors the
/// contract's disambiguation and must be verified against the live or mocked
/// contract, not assumed.
pub const fn resolve_config_nonce(current: u32, stored: u32) -> u32 {
    if stored == current {
        current + 1
    } else {
        current
    }
}

/// Computes the enable struct hash and final digest for a given domain
/// separator.
pub fn enable_digest(
    domain_separator: B256,
    vid: ValidationId,
    config_nonce: u32,
    hook: Address,
    validator_data: &Bytes,
    hook_data: &Bytes,
    selector_data: &Bytes,
) -> B256 {
    let struct_hash = Enable {
        vId: vid.into_inner(),
        nonce: config_nonce,
        hook,
        validatorData: validator_data.clone(),
        hookData: hook_data.clone(),
        selectorData: selector_data.clone(),
    }
    .eip712_hash_struct();

    let mut preimage = [0u8; 66];
    preimage[0] = 0x19;
    preimage[1] = 0x01;
    preimage[2..34].copy_from_slice(domain_separator.as_slice());
    preimage[34..66].copy_from_slice(struct_hash.as_slice());
    keccak256(preimage)
}

/// Reads the account state needed for the digest (current config nonce,
/// stored validator nonce, domain separator) and computes it.
pub async fn enable_digest_for_account(
    chain: &dyn KernelChainClient,
    config: &EngineConfig,
    account: Address,
    vid: ValidationId,
    hook: Address,
    validator_data: &Bytes,
    hook_data: &Bytes,
    selector_data: &Bytes,
) -> Result<B256, EngineError> {
    let current = with_read_retry(&config.retry, "current_config_nonce", || {
        chain.current_config_nonce(account)
    })
    .await?;
    let stored = with_read_retry(&config.retry, "validator_config", || {
        chain.validator_config(account, vid)
    })
    .await?
    .nonce;
    let domain_separator = with_read_retry(&config.retry, "domain_separator", || {
        chain.domain_separator(account)
    })
    .await?;

    let config_nonce = resolve_config_nonce(current, stored);
    Ok(enable_digest(
        domain_separator,
        vid,
        config_nonce,
        hook,
        validator_data,
        hook_data,
        selector_data,
    ))
}
