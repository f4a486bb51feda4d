//! Bit-packing primitives for v0.7 gas fields and kernel call data.
//!
//! The packed layouts here are the contract's wire format; decoding must
//! exactly invert encoding, since the review/verification path decodes
//! submitted call data back into its parts.

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;

use crate::error::EngineError;
use crate::kernel::{executeCall, EXECUTE_USER_OP_SELECTOR};

/// Packs two gas limits into one 32-byte word: verification gas limit in the
/// high 16 bytes, call gas limit in the low 16, each big-endian.
pub fn pack_account_gas_limits(verification_gas_limit: u128, call_gas_limit: u128) -> B256 {
    let word = (U256::from(verification_gas_limit) << 128usize) | U256::from(call_gas_limit);
    B256::from(word.to_be_bytes::<32>())
}

/// Inverts [`pack_account_gas_limits`].
pub fn unpack_account_gas_limits(packed: B256) -> (u128, u128) {
    split_word(packed)
}

/// Packs the fee pair into one 32-byte word: max priority fee in the high 16
/// bytes, max fee in the low 16.
pub fn pack_gas_fees(max_priority_fee_per_gas: u128, max_fee_per_gas: u128) -> B256 {
    let word = (U256::from(max_priority_fee_per_gas) << 128usize) | U256::from(max_fee_per_gas);
    B256::from(word.to_be_bytes::<32>())
}

/// Inverts [`pack_gas_fees`].
pub fn unpack_gas_fees(packed: B256) -> (u128, u128) {
    split_word(packed)
}

fn split_word(packed: B256) -> (u128, u128) {
    let word = U256::from_be_bytes(packed.0);
    let hi = (word >> 128usize).to::<u128>();
    let lo = (word & U256::from(u128::MAX)).to::<u128>();
    (hi, lo)
}

/// Encodes a single call for the kernel executor: 20-byte target ++ 32-byte
/// value ++ raw data.
pub fn encode_single_call(target: Address, value: U256, data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(52 + data.len());
    out.extend_from_slice(target.as_slice());
    out.extend_from_slice(&value.to_be_bytes::<32>());
    out.extend_from_slice(data);
    out.into()
}

/// Inverts [`encode_single_call`].
pub fn decode_single_call(encoded: &[u8]) -> Result<(Address, U256, Bytes), EngineError> {
    if encoded.len() < 52 {
        return Err(EngineError::Validation(format!(
            "single-call payload too short: {} bytes",
            encoded.len()
        )));
    }
    let target = Address::from_slice(&encoded[..20]);
    let value = U256::from_be_slice(&encoded[20..52]);
    Ok((target, value, Bytes::copy_from_slice(&encoded[52..])))
}

/// Wraps execution data in the account's `execute` call.
///
/// When the account's root hook is not the sentinel hook, the entry point
/// must dispatch through `executeUserOp`, so the call data is prefixed with
/// that 4-byte selector.
pub fn build_execute_call_data(mode: B256, exec_data: Bytes, needs_selector_prefix: bool) -> Bytes {
    let call = executeCall { execMode: mode, executionCalldata: exec_data }.abi_encode();
    if needs_selector_prefix {
        let mut out = Vec::with_capacity(4 + call.len());
        out.extend_from_slice(&EXECUTE_USER_OP_SELECTOR);
        out.extend_from_slice(&call);
        out.into()
    } else {
        call.into()
    }
}

/// Inverts [`build_execute_call_data`], returning (mode, exec data, had prefix).
pub fn decode_execute_call_data(call_data: &[u8]) -> Result<(B256, Bytes, bool), EngineError> {
    let prefixed = call_data.len() >= 4 && call_data[..4] == EXECUTE_USER_OP_SELECTOR;
    let body = if prefixed { &call_data[4..] } else { call_data };
    let decoded = executeCall::abi_decode(body, true)
        .map_err(|e| EngineError::Validation(format!("malformed execute call data: {e}")))?;
    Ok((decoded.execMode, decoded.executionCalldata, prefixed))
}
