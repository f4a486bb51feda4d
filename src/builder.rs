//! UserOperation builder.
//!
//! One build method per supported action. Each resolves the correct nonce
//! lane, encodes the inner contract call, wraps it in the account's execute
//! call, assigns gas, and computes the canonical operation hash. Operations
//! are returned unsigned; the builder never holds or generates a private key.
//!
//! Install/grant/config paths use fixed conservative gas ceilings rather than
//! bundler estimation, which under-estimates validator installation.
//! Deposit/send paths estimate and patch, falling back to the ceilings when
//! the estimator fails.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chain::{with_read_retry, with_timeout, KernelChainClient};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::identifiers::{permission_id, PermissionId, ValidationId};
use crate::kernel::{
    depositToCall, encode_install_validation, encode_permission_init_data, grantAccessCall,
    setRecipientAllowedCall, setSelectorAllowedCall, setTokenLimitCall, uninstallValidationCall,
    executeCall, HOOK_SENTINEL, EXEC_MODE_SINGLE,
};
use crate::nonce::{encode_nonce, NonceKey};
use crate::packing::{build_execute_call_data, encode_single_call};
use crate::policy::{encode_call_policy_init_data, CallPolicySettings, TokenLimit};
use crate::userop::{hash_user_operation, PackedUserOperation, UnpackedUserOperation};

/// An assembled, unsigned operation plus the material an external signer and
/// the submission path need.
#[derive(Debug, Clone)]
pub struct BuiltOperation {
    /// Packed v0.7 form for submission.
    pub packed: PackedUserOperation,
    /// Unpacked form for transport and inspection.
    pub unpacked: UnpackedUserOperation,
    /// Canonical operation hash to sign.
    pub hash: B256,
    /// The lane this operation's nonce was drawn from.
    pub nonce_key: NonceKey,
    /// The lane sequence observed at build time; confirmation watches for
    /// the increment past this value.
    pub sequence: u64,
}

impl BuiltOperation {
    /// Attaches an assembled signature to both forms.
    pub fn attach_signature(&mut self, signature: Bytes) {
        self.packed.signature = signature.clone();
        self.unpacked.signature = signature;
    }
}

/// Whether a path takes fixed ceilings or estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GasMode {
    Fixed,
    Estimate,
}

/// Builds unsigned user operations against one engine configuration.
pub struct OperationBuilder {
    chain: Arc<dyn KernelChainClient>,
    config: EngineConfig,
    // Root-hook sentinel check, cached per account for the session.
    root_hook_cache: Mutex<HashMap<Address, Address>>,
}

impl OperationBuilder {
    /// Creates a builder over the injected chain client.
    pub fn new(chain: Arc<dyn KernelChainClient>, config: EngineConfig) -> Self {
        Self { chain, config, root_hook_cache: Mutex::new(HashMap::new()) }
    }

    /// The engine configuration this builder was created with.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Deposit to the account's entry-point balance (root lane).
    pub async fn build_deposit(
        &self,
        account: Address,
        amount: U256,
    ) -> Result<BuiltOperation, EngineError> {
        let data = depositToCall { account }.abi_encode();
        let exec = encode_single_call(self.config.entry_point, amount, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Estimate).await
    }

    /// Plain send from the account (root lane).
    pub async fn build_send(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<BuiltOperation, EngineError> {
        let exec = encode_single_call(target, value, data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Estimate).await
    }

    /// Send signed by a delegated key (permission lane, default mode).
    pub async fn build_delegated_send(
        &self,
        account: Address,
        id: PermissionId,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<BuiltOperation, EngineError> {
        let exec = encode_single_call(target, value, data);
        self.assemble(account, NonceKey::permission_default(id), exec, GasMode::Estimate).await
    }

    /// Send on the enable lane; the caller assembles the enable-mode
    /// signature around the returned hash.
    pub async fn build_enable_send(
        &self,
        account: Address,
        id: PermissionId,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<BuiltOperation, EngineError> {
        let exec = encode_single_call(target, value, data);
        self.assemble(account, NonceKey::permission_enable(id), exec, GasMode::Estimate).await
    }

    /// The validator-data payload installing a sudo-policy permission for
    /// `delegate`; also signed over in the enable-mode flow.
    pub fn sudo_install_data(&self, delegate: Address) -> Bytes {
        encode_permission_init_data(
            &[(self.config.sudo_policy, Bytes::new())],
            self.config.ecdsa_signer,
            delegate,
        )
    }

    /// Installs a sudo-policy permission for `delegate` (root lane).
    pub async fn build_install_permission(
        &self,
        account: Address,
        delegate: Address,
    ) -> Result<BuiltOperation, EngineError> {
        let validator_data = self.sudo_install_data(delegate);
        self.build_install(account, delegate, validator_data).await
    }

    /// Installs a call-policy permission for `delegate` (root lane).
    pub async fn build_install_call_policy(
        &self,
        account: Address,
        delegate: Address,
        settings: &CallPolicySettings,
    ) -> Result<BuiltOperation, EngineError> {
        let validator_data = encode_permission_init_data(
            &[(self.config.call_policy, encode_call_policy_init_data(settings))],
            self.config.ecdsa_signer,
            delegate,
        );
        self.build_install(account, delegate, validator_data).await
    }

    async fn build_install(
        &self,
        account: Address,
        delegate: Address,
        validator_data: Bytes,
    ) -> Result<BuiltOperation, EngineError> {
        let id = permission_id(account, delegate);
        let vid = ValidationId::from_permission(id);

        let current = with_read_retry(&self.config.retry, "current_config_nonce", || {
            self.chain.current_config_nonce(account)
        })
        .await?;
        let stored = with_read_retry(&self.config.retry, "validator_config", || {
            self.chain.validator_config(account, vid)
        })
        .await?
        .nonce;
        let config_nonce = crate::enable::resolve_config_nonce(current, stored);

        let data = encode_install_validation(
            vid,
            config_nonce,
            HOOK_SENTINEL,
            validator_data,
            Bytes::new(),
        );
        let exec = encode_single_call(account, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Grants a validation access to a kernel selector (root lane).
    pub async fn build_grant_access(
        &self,
        account: Address,
        vid: ValidationId,
        selector: [u8; 4],
    ) -> Result<BuiltOperation, EngineError> {
        let data = grantAccessCall {
            vId: vid.into_inner(),
            selector: selector.into(),
            allow: true,
        }
        .abi_encode();
        let exec = encode_single_call(account, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Grants the new validation access to the kernel's execute selector.
    pub async fn build_grant_execute_access(
        &self,
        account: Address,
        vid: ValidationId,
    ) -> Result<BuiltOperation, EngineError> {
        self.build_grant_access(account, vid, executeCall::SELECTOR).await
    }

    /// Allows a selector on the call policy (root lane).
    pub async fn build_enable_selector(
        &self,
        account: Address,
        id: PermissionId,
        selector: [u8; 4],
    ) -> Result<BuiltOperation, EngineError> {
        let data = setSelectorAllowedCall {
            permissionId: id.0,
            selector: selector.into(),
            allowed: true,
        }
        .abi_encode();
        let exec = encode_single_call(self.config.call_policy, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Sets one token's spend limits on the call policy (root lane).
    pub async fn build_set_token_limit(
        &self,
        account: Address,
        id: PermissionId,
        limit: &TokenLimit,
    ) -> Result<BuiltOperation, EngineError> {
        let data = setTokenLimitCall {
            permissionId: id.0,
            token: limit.token,
            txLimit: limit.tx_limit,
            dailyLimit: limit.daily_limit,
            enabled: limit.enabled,
        }
        .abi_encode();
        let exec = encode_single_call(self.config.call_policy, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Allows or disallows an ETH recipient on the call policy (root lane).
    pub async fn build_set_recipient_allowed(
        &self,
        account: Address,
        id: PermissionId,
        recipient: Address,
        allowed: bool,
    ) -> Result<BuiltOperation, EngineError> {
        let data = setRecipientAllowedCall { permissionId: id.0, recipient, allowed }.abi_encode();
        let exec = encode_single_call(self.config.call_policy, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Uninstalls a permission's validator and scope (root lane).
    pub async fn build_uninstall_permission(
        &self,
        account: Address,
        id: PermissionId,
    ) -> Result<BuiltOperation, EngineError> {
        let vid = ValidationId::from_permission(id);
        let data = uninstallValidationCall {
            vId: vid.into_inner(),
            deinitData: Bytes::new(),
            hookDeinitData: Bytes::new(),
        }
        .abi_encode();
        let exec = encode_single_call(account, U256::ZERO, &data);
        self.assemble(account, NonceKey::ROOT, exec, GasMode::Fixed).await
    }

    /// Cross-checks a built operation's locally computed hash against the
    /// entry point's `getUserOpHash`. A mismatch means the local packing or
    /// hashing disagrees with the deployed contract and the operation must
    /// not be signed.
    pub async fn verify_hash(&self, built: &BuiltOperation) -> Result<(), EngineError> {
        let remote = with_read_retry(&self.config.retry, "operation_hash", || {
            self.chain.operation_hash(&built.packed)
        })
        .await?;
        if remote != built.hash {
            return Err(EngineError::Validation(format!(
                "operation hash mismatch: local {}, entry point {remote}",
                built.hash
            )));
        }
        Ok(())
    }

    /// Whether call data must carry the `executeUserOp` dispatch prefix:
    /// true when the account's root hook is not the sentinel hook. The
    /// on-chain read is cached per account for the session.
    async fn needs_selector_prefix(&self, account: Address) -> Result<bool, EngineError> {
        if let Some(hook) = self.root_hook_cache.lock().await.get(&account) {
            return Ok(*hook != HOOK_SENTINEL);
        }
        let hook = with_read_retry(&self.config.retry, "root_hook", || {
            self.chain.root_hook(account)
        })
        .await?;
        self.root_hook_cache.lock().await.insert(account, hook);
        Ok(hook != HOOK_SENTINEL)
    }

    async fn assemble(
        &self,
        account: Address,
        key: NonceKey,
        exec_data: Bytes,
        gas_mode: GasMode,
    ) -> Result<BuiltOperation, EngineError> {
        let sequence = with_read_retry(&self.config.retry, "sequence_nonce", || {
            self.chain.sequence_nonce(account, &key)
        })
        .await?;
        let prefix = self.needs_selector_prefix(account).await?;
        let call_data = build_execute_call_data(EXEC_MODE_SINGLE, exec_data, prefix);

        let gas = self.config.gas;
        let mut op = UnpackedUserOperation {
            sender: account,
            nonce: encode_nonce(key, sequence),
            init_code: Bytes::new(),
            call_data,
            call_gas_limit: gas.call_gas_limit,
            verification_gas_limit: gas.verification_gas_limit,
            pre_verification_gas: gas.pre_verification_gas,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            paymaster_and_data: Bytes::new(),
            signature: Bytes::new(),
        };

        if gas_mode == GasMode::Estimate {
            match with_timeout(
                self.config.call_timeout,
                "estimate_operation_gas",
                self.chain.estimate_operation_gas(&op),
            )
            .await
            {
                Ok(estimate) => {
                    debug!(?estimate, sender = %account, "patched gas from estimator");
                    op.call_gas_limit = estimate.call_gas_limit;
                    op.verification_gas_limit = estimate.verification_gas_limit;
                    op.pre_verification_gas = estimate.pre_verification_gas;
                }
                Err(err) => {
                    warn!(error = %err, sender = %account, "gas estimation failed, using ceilings");
                }
            }
        }

        let packed = op.pack();
        let hash = hash_user_operation(&packed, self.config.entry_point, self.config.chain_id);
        Ok(BuiltOperation { packed, unpacked: op, hash, nonce_key: key, sequence })
    }
}
