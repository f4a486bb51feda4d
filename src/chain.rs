//! Injected chain-client capability and the read-only retry policy.
//!
//! The engine depends only on this trait's contract, never on a concrete RPC
//! client. Read-only calls may be retried with backoff; the two submission
//! RPCs (`estimate_operation_gas`, `submit_operation`) are invoked at most
//! once per built operation.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::identifiers::{PermissionId, ValidationId};
use crate::nonce::NonceKey;
use crate::userop::{PackedUserOperation, UnpackedUserOperation};

/// On-chain validator configuration, as stored by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorConfig {
    /// The config nonce recorded when the validator was installed.
    pub nonce: u32,
    /// The hook attached to the validator; zero when not installed.
    pub hook: Address,
}

/// Bundler gas estimate for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    /// Estimated execution-phase gas.
    pub call_gas_limit: u128,
    /// Estimated verification-phase gas.
    pub verification_gas_limit: u128,
    /// Estimated pre-verification gas.
    pub pre_verification_gas: u128,
}

/// Read and submission RPCs against the kernel account, its entry point, and
/// the call-policy module.
#[async_trait]
pub trait KernelChainClient: Send + Sync {
    /// The account's current config nonce (uint32 installation counter).
    async fn current_config_nonce(&self, account: Address) -> Result<u32, EngineError>;

    /// The 64-bit sequence for one nonce lane, from the entry point's
    /// `getNonce(account, key)`.
    async fn sequence_nonce(&self, account: Address, key: &NonceKey) -> Result<u64, EngineError>;

    /// The stored configuration for a validation id.
    async fn validator_config(
        &self,
        account: Address,
        vid: ValidationId,
    ) -> Result<ValidatorConfig, EngineError>;

    /// The account's root validator id.
    async fn root_validator(&self, account: Address) -> Result<ValidationId, EngineError>;

    /// The hook attached to the root validator.
    async fn root_hook(&self, account: Address) -> Result<Address, EngineError>;

    /// The account's EIP-712 domain separator.
    async fn domain_separator(&self, account: Address) -> Result<B256, EngineError>;

    /// The account's entry-point deposit, in wei.
    async fn entry_point_deposit(&self, account: Address) -> Result<U256, EngineError>;

    /// Tokens currently limit-listed for a permission on the call policy.
    async fn allowed_tokens(
        &self,
        account: Address,
        id: PermissionId,
    ) -> Result<Vec<Address>, EngineError>;

    /// Recipients currently allow-listed for a permission on the call policy.
    async fn allowed_recipients(
        &self,
        account: Address,
        id: PermissionId,
    ) -> Result<Vec<Address>, EngineError>;

    /// The canonical hash of a packed operation, from the entry point's
    /// `getUserOpHash`. Lets callers cross-check the locally computed hash.
    async fn operation_hash(&self, op: &PackedUserOperation) -> Result<B256, EngineError>;

    /// Bundler gas estimation for an unsigned operation.
    async fn estimate_operation_gas(
        &self,
        op: &UnpackedUserOperation,
    ) -> Result<GasEstimate, EngineError>;

    /// Submits a signed packed operation; returns the bundler's operation hash.
    async fn submit_operation(&self, op: &PackedUserOperation) -> Result<B256, EngineError>;
}

/// Runs a read-only call with the retry policy, retrying only
/// [`EngineError::ChainRpc`] failures.
pub async fn with_read_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut backoff = policy.to_backoff();
    let mut attempt = 1u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                warn!(call = what, attempt, error = %err, "read call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bounds an external call, mapping expiry to [`EngineError::Timeout`].
pub async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(format!("{what} exceeded {timeout:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_rpc_errors_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        };
        let result: Result<(), _> = with_read_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::ChainRpc("503".into())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::ChainRpc(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_rpc_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), _> = with_read_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::reverted("AA21")) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::ExecutionReverted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        };
        let result = with_read_retry(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::ChainRpc("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_engine_error() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(EngineError::Timeout(msg)) => assert!(msg.contains("slow call")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
