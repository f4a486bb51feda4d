//! Prefund guard.
//!
//! The entry point charges an account's deposit up to
//! `(preVerificationGas + verificationGasLimit + callGasLimit) * maxFeePerGas`.
//! An operation known in advance to under-pay is never submitted; the guard
//! short-circuits with the exact shortfall instead.

use alloy_primitives::{Address, U256};

use crate::chain::{with_read_retry, KernelChainClient};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::userop::UnpackedUserOperation;

/// Worst-case wei the entry point may charge for an operation.
pub fn required_prefund(op: &UnpackedUserOperation) -> U256 {
    let gas = U256::from(op.pre_verification_gas)
        + U256::from(op.verification_gas_limit)
        + U256::from(op.call_gas_limit);
    gas * U256::from(op.max_fee_per_gas)
}

/// Checks the account's entry-point deposit against the worst-case charge,
/// returning [`EngineError::PrefundShortfall`] when it cannot cover it.
pub async fn ensure_prefunded(
    chain: &dyn KernelChainClient,
    config: &EngineConfig,
    account: Address,
    op: &UnpackedUserOperation,
) -> Result<(), EngineError> {
    let required = required_prefund(op);
    let deposit = with_read_retry(&config.retry, "entry_point_deposit", || {
        chain.entry_point_deposit(account)
    })
    .await?;
    if deposit < required {
        return Err(EngineError::PrefundShortfall {
            required,
            deposit,
            shortfall: required - deposit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(pre: u128, verification: u128, call: u128, max_fee: u128) -> UnpackedUserOperation {
        UnpackedUserOperation {
            pre_verification_gas: pre,
            verification_gas_limit: verification,
            call_gas_limit: call,
            max_fee_per_gas: max_fee,
            ..Default::default()
        }
    }

    #[test]
    fn required_prefund_sums_gas_then_scales() {
        let required = required_prefund(&op(50_000, 200_000, 100_000, 1_000_000_000));
        assert_eq!(required, U256::from(350_000u64) * U256::from(1_000_000_000u64));
    }

    #[test]
    fn shortfall_is_exact() {
        // deposit=1000 wei, required=(50000+200000+100000)*1e9 wei
        let required = required_prefund(&op(50_000, 200_000, 100_000, 1_000_000_000));
        let deposit = U256::from(1000u64);
        assert_eq!(required - deposit, U256::from(349_999_999_999_000u128));
    }
}
