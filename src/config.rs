//! Engine configuration.

use std::time::Duration;

use alloy_primitives::{address, Address};
use backoff::ExponentialBackoff;

/// ERC-4337 v0.7 entry-point address (canonical deployment).
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

/// Fixed gas ceilings applied to install/grant/uninstall operations.
///
/// These paths deliberately skip bundler estimation, which routinely
/// under-estimates validator installation, and use conservative ceilings
/// instead. Deposit/send paths estimate and fall back to these on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasCeilings {
    /// Gas limit for the execution phase.
    pub call_gas_limit: u128,
    /// Gas limit for the verification phase.
    pub verification_gas_limit: u128,
    /// Gas paid to the bundler before verification.
    pub pre_verification_gas: u128,
    /// EIP-1559 max fee per gas, in wei.
    pub max_fee_per_gas: u128,
    /// EIP-1559 max priority fee per gas, in wei.
    pub max_priority_fee_per_gas: u128,
}

impl Default for GasCeilings {
    fn default() -> Self {
        Self {
            call_gas_limit: 1_000_000,
            verification_gas_limit: 1_500_000,
            pre_verification_gas: 100_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        }
    }
}

/// Retry schedule for read-only chain calls.
///
/// State-changing submissions are never retried; a duplicate submission on the
/// same lane would race its own nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff interval.
    pub initial_interval: Duration,
    /// Backoff interval ceiling.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Builds the interval generator for one retried call.
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Static configuration for the engine: deployed module addresses, chain
/// identity, gas ceilings, and timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The entry-point contract validating and executing operations.
    pub entry_point: Address,
    /// Chain id mixed into every operation hash.
    pub chain_id: u64,
    /// The permission validator module installed for delegated keys.
    pub permission_validator: Address,
    /// The sudo policy contract (single-policy composition).
    pub sudo_policy: Address,
    /// The call-policy contract enforcing target/token/selector limits.
    pub call_policy: Address,
    /// The ECDSA signer contract checking delegated-key signatures.
    pub ecdsa_signer: Address,
    /// Gas ceilings for non-estimated paths and estimator fallback.
    pub gas: GasCeilings,
    /// Number of sequence-nonce polls before a submission counts as failed.
    pub confirm_polls: u32,
    /// Delay between confirmation polls.
    pub poll_interval: Duration,
    /// Timeout applied to every external call.
    pub call_timeout: Duration,
    /// Retry schedule for read-only calls.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Builds a config for the given chain and module deployment, with
    /// default gas ceilings and timing.
    pub fn new(
        chain_id: u64,
        permission_validator: Address,
        sudo_policy: Address,
        call_policy: Address,
        ecdsa_signer: Address,
    ) -> Self {
        Self {
            entry_point: ENTRY_POINT_V07,
            chain_id,
            permission_validator,
            sudo_policy,
            call_policy,
            ecdsa_signer,
            gas: GasCeilings::default(),
            confirm_polls: 5,
            poll_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}
