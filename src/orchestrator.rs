//! Installation orchestrator.
//!
//! A single-flow state machine per installation id:
//! Idle → Installing → Granting → (call-policy only) SettingLimits →
//! Verifying → Completed, with Failed reachable from any non-terminal state.
//!
//! Submissions are confirmed by observing the lane's sequence-nonce increment
//! within a bounded polling window; a reported submission hash without an
//! observed increment counts as failed. State-changing steps are never
//! retried automatically; callers restart with a fresh installation id.

use std::collections::BTreeSet;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolCall;
use tracing::{info, warn};

use crate::builder::{BuiltOperation, OperationBuilder};
use crate::chain::{with_read_retry, with_timeout, KernelChainClient};
use crate::config::EngineConfig;
use crate::enable::enable_digest_for_account;
use crate::error::EngineError;
use crate::events::{InstallStep, ProgressSink, StatusEvent};
use crate::identifiers::{permission_id, PermissionId, ValidationId};
use crate::kernel::{executeCall, HOOK_SENTINEL};
use crate::nonce::{LaneLocks, NonceKey};
use crate::policy::{normalize_call_policy, CallPolicyRequest, CallPolicySettings};
use crate::prefund::ensure_prefunded;
use crate::signer::{
    enable_signature, permission_signature, root_signature, KeyRole, OperationSigner,
};
use crate::store::{DelegatedKeyRecord, KeyStore, KeyType};

/// Parameters for one installation flow.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Progress-sink session the flow publishes to.
    pub session_id: String,
    /// Fresh id for this installation; also the record id.
    pub installation_id: String,
    /// The kernel account to install on.
    pub account: Address,
    /// The delegated key's public address.
    pub delegate: Address,
    /// Human-readable device label for the record.
    pub label: String,
    /// Sudo or call-policy.
    pub key_type: KeyType,
    /// Raw policy input; required when `key_type` is [`KeyType::CallPolicy`].
    pub policy: Option<CallPolicyRequest>,
}

/// Result of a completed installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    /// The derived permission id.
    pub permission_id: PermissionId,
    /// The derived validation id.
    pub vid: ValidationId,
}

/// The engine: builds, signs via hand-off, submits, confirms, and publishes
/// progress. One instance may run many installations; root-lane nonce
/// consumption is serialized through [`LaneLocks`].
pub struct KernelEngine {
    chain: Arc<dyn KernelChainClient>,
    signer: Arc<dyn OperationSigner>,
    sink: Arc<dyn ProgressSink>,
    store: Arc<dyn KeyStore>,
    builder: OperationBuilder,
    locks: LaneLocks,
    config: EngineConfig,
}

impl KernelEngine {
    /// Wires the engine from its injected capabilities.
    pub fn new(
        chain: Arc<dyn KernelChainClient>,
        signer: Arc<dyn OperationSigner>,
        sink: Arc<dyn ProgressSink>,
        store: Arc<dyn KeyStore>,
        config: EngineConfig,
    ) -> Self {
        let builder = OperationBuilder::new(chain.clone(), config.clone());
        Self { chain, signer, sink, store, builder, locks: LaneLocks::new(), config }
    }

    /// The builder, for callers assembling operations outside a flow.
    pub const fn builder(&self) -> &OperationBuilder {
        &self.builder
    }

    /// Runs one installation flow to a terminal state.
    pub async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, EngineError> {
        let id = permission_id(request.account, request.delegate);
        let vid = ValidationId::from_permission(id);

        let settings = match (&request.key_type, &request.policy) {
            (KeyType::CallPolicy, Some(policy)) => Some(normalize_call_policy(policy)?),
            (KeyType::CallPolicy, None) => {
                return Err(EngineError::Validation(
                    "call-policy installation requires policy settings".to_string(),
                ))
            }
            (KeyType::Sudo, _) => None,
        };

        let mut record = DelegatedKeyRecord {
            id: request.installation_id.clone(),
            label: request.label.clone(),
            key_type: request.key_type,
            account: request.account,
            address: request.delegate,
            permission_id: id,
            vid,
            status: InstallStep::Installing,
            submission_hash: None,
            error: None,
        };
        self.store.save(&record).await?;

        match self.run_install_steps(&request, id, vid, settings.as_ref(), &mut record).await {
            Ok(()) => {
                record.status = InstallStep::Completed;
                self.store.update(&record).await?;
                let mut event =
                    StatusEvent::step(InstallStep::Completed, "delegated key installed", 100);
                event.permission_id = Some(id);
                event.vid = Some(vid);
                if let Some(tx_hash) = record.submission_hash {
                    event.tx_hash = Some(tx_hash);
                }
                self.sink.publish(&request.session_id, event);
                info!(account = %request.account, %id, "installation completed");
                Ok(InstallOutcome { permission_id: id, vid })
            }
            Err(err) => {
                record.status = InstallStep::Failed;
                record.error = Some(err.to_string());
                if let Err(store_err) = self.store.update(&record).await {
                    warn!(error = %store_err, "failed to persist failed record");
                }
                let mut event = StatusEvent::step(InstallStep::Failed, err.user_message(), 0);
                event.error = Some(err.user_message());
                self.sink.publish(&request.session_id, event);
                Err(err)
            }
        }
    }

    async fn run_install_steps(
        &self,
        request: &InstallRequest,
        id: PermissionId,
        vid: ValidationId,
        settings: Option<&CallPolicySettings>,
        record: &mut DelegatedKeyRecord,
    ) -> Result<(), EngineError> {
        // Installing. The prefund guard inside submit_root gates this before
        // any nonce is consumed.
        self.publish(request, InstallStep::Installing, "installing permission validator", 10);
        let tx_hash = {
            let _lane = self.locks.acquire(request.account, NonceKey::ROOT).await;
            let built = match settings {
                Some(settings) => {
                    self.builder
                        .build_install_call_policy(request.account, request.delegate, settings)
                        .await?
                }
                None => {
                    self.builder.build_install_permission(request.account, request.delegate).await?
                }
            };
            self.submit_root(request.account, built).await?
        };
        record.submission_hash = Some(tx_hash);
        record.status = InstallStep::Granting;
        self.store.update(record).await?;

        // Granting.
        self.publish_with_hash(request, InstallStep::Granting, "granting execute access", 40, tx_hash);
        let tx_hash = {
            let _lane = self.locks.acquire(request.account, NonceKey::ROOT).await;
            let built = self.builder.build_grant_execute_access(request.account, vid).await?;
            self.submit_root(request.account, built).await?
        };
        record.submission_hash = Some(tx_hash);

        // SettingLimits (call-policy only), with one-shot remediation.
        if let Some(settings) = settings {
            record.status = InstallStep::SettingLimits;
            self.store.update(record).await?;
            self.publish(request, InstallStep::SettingLimits, "configuring policy limits", 60);
            self.apply_policy_limits(request.account, id, settings).await?;
        }

        // Verifying.
        self.publish(request, InstallStep::Verifying, "verifying installation", 85);
        record.status = InstallStep::Verifying;
        self.store.update(record).await?;
        let config = with_read_retry(&self.config.retry, "validator_config", || {
            self.chain.validator_config(request.account, vid)
        })
        .await?;
        if config.hook == Address::ZERO {
            return Err(EngineError::PersistencePartialFailure(format!(
                "validator {vid} config not persisted"
            )));
        }
        Ok(())
    }

    /// Submits the requested recipients and token limits, reads back the
    /// on-chain sets, re-submits the missing subset exactly once, and fails
    /// with a "not persisted" classification if anything is still missing.
    async fn apply_policy_limits(
        &self,
        account: Address,
        id: PermissionId,
        settings: &CallPolicySettings,
    ) -> Result<(), EngineError> {
        for recipient in &settings.allowed_recipients {
            self.submit_recipient(account, id, *recipient).await?;
        }
        for limit in &settings.token_limits {
            self.submit_token_limit(account, id, limit).await?;
        }

        let (missing_recipients, missing_tokens) = self.missing_policy_state(account, id, settings).await?;
        if missing_recipients.is_empty() && missing_tokens.is_empty() {
            return Ok(());
        }

        warn!(
            account = %account,
            recipients = missing_recipients.len(),
            tokens = missing_tokens.len(),
            "policy state incomplete after first pass, re-submitting once"
        );
        for recipient in &missing_recipients {
            self.submit_recipient(account, id, *recipient).await?;
        }
        for token in &missing_tokens {
            let limit = settings
                .token_limits
                .iter()
                .find(|l| l.token == *token)
                .ok_or_else(|| {
                    EngineError::PersistencePartialFailure(format!(
                        "unknown token {token} reported missing"
                    ))
                })?;
            self.submit_token_limit(account, id, limit).await?;
        }

        let (still_recipients, still_tokens) = self.missing_policy_state(account, id, settings).await?;
        if !still_recipients.is_empty() || !still_tokens.is_empty() {
            return Err(EngineError::PersistencePartialFailure(format!(
                "policy state not persisted: {} recipient(s), {} token(s) missing after re-submit",
                still_recipients.len(),
                still_tokens.len()
            )));
        }
        Ok(())
    }

    async fn missing_policy_state(
        &self,
        account: Address,
        id: PermissionId,
        settings: &CallPolicySettings,
    ) -> Result<(Vec<Address>, Vec<Address>), EngineError> {
        let on_chain_recipients: BTreeSet<Address> =
            with_read_retry(&self.config.retry, "allowed_recipients", || {
                self.chain.allowed_recipients(account, id)
            })
            .await?
            .into_iter()
            .collect();
        let on_chain_tokens: BTreeSet<Address> =
            with_read_retry(&self.config.retry, "allowed_tokens", || {
                self.chain.allowed_tokens(account, id)
            })
            .await?
            .into_iter()
            .collect();

        let missing_recipients = settings
            .allowed_recipients
            .iter()
            .filter(|r| !on_chain_recipients.contains(*r))
            .copied()
            .collect();
        let missing_tokens = settings
            .token_limits
            .iter()
            .map(|l| l.token)
            .filter(|t| !on_chain_tokens.contains(t))
            .collect();
        Ok((missing_recipients, missing_tokens))
    }

    async fn submit_recipient(
        &self,
        account: Address,
        id: PermissionId,
        recipient: Address,
    ) -> Result<B256, EngineError> {
        let _lane = self.locks.acquire(account, NonceKey::ROOT).await;
        let built =
            self.builder.build_set_recipient_allowed(account, id, recipient, true).await?;
        self.submit_root(account, built).await
    }

    async fn submit_token_limit(
        &self,
        account: Address,
        id: PermissionId,
        limit: &crate::policy::TokenLimit,
    ) -> Result<B256, EngineError> {
        let _lane = self.locks.acquire(account, NonceKey::ROOT).await;
        let built = self.builder.build_set_token_limit(account, id, limit).await?;
        self.submit_root(account, built).await
    }

    /// Deposits into the account's entry-point balance (root lane).
    pub async fn deposit(&self, account: Address, amount: U256) -> Result<B256, EngineError> {
        let _lane = self.locks.acquire(account, NonceKey::ROOT).await;
        let built = self.builder.build_deposit(account, amount).await?;
        self.submit_root(account, built).await
    }

    /// Sends from the account with the root key (root lane).
    pub async fn send(
        &self,
        account: Address,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<B256, EngineError> {
        let _lane = self.locks.acquire(account, NonceKey::ROOT).await;
        let built = self.builder.build_send(account, target, value, data).await?;
        self.submit_root(account, built).await
    }

    /// Sends from the account with a delegated key (permission lane).
    pub async fn send_delegated(
        &self,
        account: Address,
        id: PermissionId,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<B256, EngineError> {
        let key = NonceKey::permission_default(id);
        let _lane = self.locks.acquire(account, key).await;
        let mut built =
            self.builder.build_delegated_send(account, id, target, value, data).await?;
        ensure_prefunded(self.chain.as_ref(), &self.config, account, &built.unpacked).await?;
        let sig = self.sign(built.hash, KeyRole::Delegated).await?;
        built.attach_signature(permission_signature(&sig)?);
        self.submit_and_confirm(account, &built).await
    }

    /// Sends with a delegated key while enabling its permission inline
    /// (enable lane). The enable digest authorizes the capability escalation
    /// and is always signed by the root key; the operation itself is signed
    /// by the delegated key.
    pub async fn send_delegated_with_enable(
        &self,
        account: Address,
        delegate: Address,
        target: Address,
        value: U256,
        data: &[u8],
    ) -> Result<B256, EngineError> {
        let id = permission_id(account, delegate);
        let vid = ValidationId::from_permission(id);
        let key = NonceKey::permission_enable(id);
        let _lane = self.locks.acquire(account, key).await;

        let mut built = self.builder.build_enable_send(account, id, target, value, data).await?;
        ensure_prefunded(self.chain.as_ref(), &self.config, account, &built.unpacked).await?;

        let validator_data = self.builder.sudo_install_data(delegate);
        let hook_data = alloy_primitives::Bytes::new();
        let selector_data = alloy_primitives::Bytes::copy_from_slice(&executeCall::SELECTOR);
        let digest = enable_digest_for_account(
            self.chain.as_ref(),
            &self.config,
            account,
            vid,
            HOOK_SENTINEL,
            &validator_data,
            &hook_data,
            &selector_data,
        )
        .await?;

        let enable_sig = self.sign(digest, KeyRole::Root).await?;
        let op_sig = permission_signature(&self.sign(built.hash, KeyRole::Delegated).await?)?;
        built.attach_signature(enable_signature(
            HOOK_SENTINEL,
            &enable_sig,
            &op_sig,
            &validator_data,
            &hook_data,
            &selector_data,
        )?);
        self.submit_and_confirm(account, &built).await
    }

    /// Revokes a delegated key: uninstalls its validator (root lane) and, on
    /// confirmed submission, deletes the record.
    pub async fn revoke(&self, session_id: &str, record_id: &str) -> Result<(), EngineError> {
        let record = self
            .store
            .get(record_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("unknown record {record_id}")))?;

        let tx_hash = {
            let _lane = self.locks.acquire(record.account, NonceKey::ROOT).await;
            let built = self
                .builder
                .build_uninstall_permission(record.account, record.permission_id)
                .await?;
            self.submit_root(record.account, built).await?
        };
        self.store.delete(record_id).await?;
        info!(account = %record.account, id = %record.permission_id, "permission revoked");
        self.sink.publish(
            session_id,
            StatusEvent::step(InstallStep::Completed, "delegated key revoked", 100)
                .with_tx_hash(tx_hash),
        );
        Ok(())
    }

    /// Prefund-guards, root-signs, submits, and confirms one built operation.
    /// The caller must hold the root lane lock.
    async fn submit_root(
        &self,
        account: Address,
        mut built: BuiltOperation,
    ) -> Result<B256, EngineError> {
        ensure_prefunded(self.chain.as_ref(), &self.config, account, &built.unpacked).await?;
        let sig = self.sign(built.hash, KeyRole::Root).await?;
        built.attach_signature(root_signature(&sig)?);
        self.submit_and_confirm(account, &built).await
    }

    async fn sign(&self, hash: B256, role: KeyRole) -> Result<alloy_primitives::Bytes, EngineError> {
        with_timeout(self.config.call_timeout, "sign", self.signer.sign(hash, role)).await
    }

    /// Submits once and polls the lane sequence for the increment. Submission
    /// is never repeated; an unobserved increment is a definite failure.
    async fn submit_and_confirm(
        &self,
        account: Address,
        built: &BuiltOperation,
    ) -> Result<B256, EngineError> {
        let tx_hash = with_timeout(
            self.config.call_timeout,
            "submit_operation",
            self.chain.submit_operation(&built.packed),
        )
        .await?;
        info!(%account, %tx_hash, sequence = built.sequence, "operation submitted");

        for _ in 0..self.config.confirm_polls {
            tokio::time::sleep(self.config.poll_interval).await;
            let sequence = with_read_retry(&self.config.retry, "sequence_nonce", || {
                self.chain.sequence_nonce(account, &built.nonce_key)
            })
            .await?;
            if sequence > built.sequence {
                return Ok(tx_hash);
            }
        }
        Err(EngineError::Timeout(format!(
            "nonce increment not observed for {tx_hash} after {} polls",
            self.config.confirm_polls
        )))
    }

    fn publish(&self, request: &InstallRequest, step: InstallStep, message: &str, progress: u8) {
        self.sink.publish(&request.session_id, StatusEvent::step(step, message, progress));
    }

    fn publish_with_hash(
        &self,
        request: &InstallRequest,
        step: InstallStep,
        message: &str,
        progress: u8,
        tx_hash: B256,
    ) {
        self.sink.publish(
            &request.session_id,
            StatusEvent::step(step, message, progress).with_tx_hash(tx_hash),
        );
    }
}
