//! Engine error taxonomy.
//!
//! Every fallible path in the crate surfaces one of these variants. Read-only
//! chain calls may be retried on [`EngineError::ChainRpc`]; state-changing
//! submissions are never retried automatically.

use alloy_primitives::U256;
use thiserror::Error;

/// Errors produced by the user-operation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input (address, selector, limit) rejected before any chain call.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The account's entry-point deposit cannot cover the worst-case gas cost.
    #[error("insufficient prefund: required {required}, deposit {deposit}, shortfall {shortfall}")]
    PrefundShortfall {
        /// Worst-case wei the entry point may charge for the operation.
        required: U256,
        /// The account's current entry-point deposit.
        deposit: U256,
        /// Exactly `required - deposit`.
        shortfall: U256,
    },
    /// Network or rate-limit failure talking to the chain client.
    #[error("chain rpc error: {0}")]
    ChainRpc(String),
    /// The operation reverted on chain.
    #[error("execution reverted ({category}): {raw}")]
    ExecutionReverted {
        /// Human-readable failure category, safe to show to a user.
        category: String,
        /// The raw revert data or bundler error, preserved verbatim.
        raw: String,
    },
    /// An on-chain step succeeded but dependent policy state did not persist.
    #[error("persistence failure: {0}")]
    PersistencePartialFailure(String),
    /// A bounded wait (confirmation polling, call timeout) expired.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The injected signer refused or failed to produce a signature.
    #[error("signer error: {0}")]
    Signer(String),
    /// The injected key store failed.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Builds an [`EngineError::ExecutionReverted`] with a classified category.
    pub fn reverted(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self::ExecutionReverted { category: classify_revert(&raw).to_string(), raw }
    }

    /// True for errors that are safe to retry (read-only calls only).
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainRpc(_))
    }

    /// A short message suitable for surfacing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid input: {msg}"),
            Self::PrefundShortfall { shortfall, .. } => {
                format!("account deposit too low, missing {shortfall} wei")
            }
            Self::ChainRpc(_) => "network error, please try again".to_string(),
            Self::ExecutionReverted { category, .. } => category.clone(),
            Self::PersistencePartialFailure(msg) => msg.clone(),
            Self::Timeout(_) => "operation not confirmed in time".to_string(),
            Self::Signer(_) => "signing failed".to_string(),
            Self::Store(_) => "local storage failed".to_string(),
        }
    }
}

/// Maps raw revert data to a human-readable category.
///
/// AA-prefixed codes follow the ERC-4337 entry-point error convention.
pub fn classify_revert(raw: &str) -> &'static str {
    if raw.contains("AA21") || raw.contains("prefund") {
        "didn't pay prefund"
    } else if raw.contains("AA25") || raw.contains("nonce") {
        "invalid nonce"
    } else if raw.contains("AA24") || raw.contains("signature") {
        "signature rejected"
    } else {
        "reverted"
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::prefund("AA21 didn't pay prefund", "didn't pay prefund")]
    #[case::nonce("AA25 invalid account nonce", "invalid nonce")]
    #[case::signature("AA24 signature error", "signature rejected")]
    #[case::other("execution reverted: SomeCustomError()", "reverted")]
    fn classifies_reverts(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(classify_revert(raw), expected);
        match EngineError::reverted(raw) {
            EngineError::ExecutionReverted { category, raw: kept } => {
                assert_eq!(category, expected);
                assert_eq!(kept, raw);
            }
            other => panic!("expected ExecutionReverted, got {other:?}"),
        }
    }

    #[test]
    fn only_rpc_errors_are_retryable() {
        assert!(EngineError::ChainRpc("503".into()).is_retryable());
        assert!(!EngineError::Timeout("poll".into()).is_retryable());
        assert!(!EngineError::reverted("AA21").is_retryable());
    }

    #[test]
    fn prefund_message_carries_shortfall() {
        let err = EngineError::PrefundShortfall {
            required: U256::from(1500u64),
            deposit: U256::from(1000u64),
            shortfall: U256::from(500u64),
        };
        assert!(err.user_message().contains("500"));
    }
}
