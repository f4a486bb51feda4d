//! Signing hand-off and signature assembly.
//!
//! The engine never holds or derives a private key: it produces signable
//! material (operation hashes, EIP-712 digests), hands it to the injected
//! [`OperationSigner`], and reassembles the validator-specific signature
//! envelope around the returned 65-byte ECDSA signature.

use alloy_primitives::{Address, Bytes, B256};
use alloy_sol_types::SolValue;
use async_trait::async_trait;

use crate::error::EngineError;

/// Which key the external signer should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// The account's root key.
    Root,
    /// A delegated (permission-scoped) key.
    Delegated,
}

/// Injected signing capability; returns a 65-byte ECDSA signature over the
/// given 32-byte hash or digest.
#[async_trait]
pub trait OperationSigner: Send + Sync {
    /// Signs `digest` with the key for `role`.
    async fn sign(&self, digest: B256, role: KeyRole) -> Result<Bytes, EngineError>;
}

const ECDSA_SIGNATURE_LEN: usize = 65;

fn require_ecdsa(sig: &Bytes) -> Result<(), EngineError> {
    if sig.len() != ECDSA_SIGNATURE_LEN {
        return Err(EngineError::Signer(format!(
            "expected {ECDSA_SIGNATURE_LEN}-byte signature, got {}",
            sig.len()
        )));
    }
    Ok(())
}

/// Root-lane signature: the raw 65-byte ECDSA signature over the operation
/// hash, validated for length.
pub fn root_signature(sig: &Bytes) -> Result<Bytes, EngineError> {
    require_ecdsa(sig)?;
    Ok(sig.clone())
}

/// Permission-lane signature envelope:
/// policy index 0x00 ++ 8-byte zero length ++ 0xff ++ 65-byte delegated sig.
///
/// Supports exactly one sudo-style policy entry; multi-policy composition is
/// an unimplemented extension point.
pub fn permission_signature(delegated_sig: &Bytes) -> Result<Bytes, EngineError> {
    require_ecdsa(delegated_sig)?;
    let mut out = Vec::with_capacity(10 + ECDSA_SIGNATURE_LEN);
    out.push(0x00);
    out.extend_from_slice(&[0u8; 8]);
    out.push(0xff);
    out.extend_from_slice(delegated_sig);
    Ok(out.into())
}

/// Enable-mode signature: 20-byte hook address ++ abi.encode(enableSig,
/// userOpSig, validatorData, hookData, selectorData).
///
/// `enable_sig` is a root signature over the EIP-712 enable digest;
/// `user_op_sig` is the permission-lane signature over the operation's own
/// hash.
pub fn enable_signature(
    hook: Address,
    enable_sig: &Bytes,
    user_op_sig: &Bytes,
    validator_data: &Bytes,
    hook_data: &Bytes,
    selector_data: &Bytes,
) -> Result<Bytes, EngineError> {
    require_ecdsa(enable_sig)?;
    let payload = (
        enable_sig.clone(),
        user_op_sig.clone(),
        validator_data.clone(),
        hook_data.clone(),
        selector_data.clone(),
    )
        .abi_encode();
    let mut out = Vec::with_capacity(20 + payload.len());
    out.extend_from_slice(hook.as_slice());
    out.extend_from_slice(&payload);
    Ok(out.into())
}
