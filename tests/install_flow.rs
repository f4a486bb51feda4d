//! Mocked end-to-end installation, remediation, and revocation flows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{address, keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use kernel_aa::chain::{GasEstimate, KernelChainClient, ValidatorConfig};
use kernel_aa::config::{EngineConfig, ENTRY_POINT_V07};
use kernel_aa::error::EngineError;
use kernel_aa::events::{InstallStep, ProgressSink, StatusEvent};
use kernel_aa::identifiers::{permission_id, PermissionId, ValidationId};
use kernel_aa::nonce::{decode_nonce, NonceKey};
use kernel_aa::orchestrator::{InstallRequest, KernelEngine};
use kernel_aa::policy::{CallPolicyRequest, TokenLimitRequest};
use kernel_aa::signer::{KeyRole, OperationSigner};
use kernel_aa::store::{DelegatedKeyRecord, KeyStore, KeyType};
use kernel_aa::userop::{hash_user_operation, PackedUserOperation, UnpackedUserOperation};

const ACCOUNT: Address = address!("1111111111111111111111111111111111111111");
const DELEGATE: Address = address!("2222222222222222222222222222222222222222");
const RECIPIENT: Address = address!("3333333333333333333333333333333333333333");
const TOKEN: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");

/// Scripted chain mock: submissions advance the submitted lane's sequence,
/// and read-backs of policy state pop scripted responses.
#[derive(Default)]
struct MockChain {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    sequences: HashMap<(Address, NonceKey), u64>,
    submissions: Vec<PackedUserOperation>,
    // When non-empty, each allowed_recipients call pops the front entry;
    // when empty, returns everything requested so far.
    recipient_script: Vec<Vec<Address>>,
    token_script: Vec<Vec<Address>>,
    all_recipients: Vec<Address>,
    all_tokens: Vec<Address>,
    deposit: U256,
    confirm_submissions: bool,
}

impl MockChain {
    fn new() -> Self {
        let chain = Self::default();
        {
            let mut state = chain.state.lock().unwrap();
            state.deposit = U256::MAX;
            state.confirm_submissions = true;
            state.all_recipients = vec![RECIPIENT];
            state.all_tokens = vec![TOKEN];
        }
        chain
    }

    fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }
}

#[async_trait]
impl KernelChainClient for MockChain {
    async fn current_config_nonce(&self, _: Address) -> Result<u32, EngineError> {
        Ok(1)
    }

    async fn sequence_nonce(&self, account: Address, key: &NonceKey) -> Result<u64, EngineError> {
        Ok(*self.state.lock().unwrap().sequences.get(&(account, *key)).unwrap_or(&0))
    }

    async fn validator_config(
        &self,
        _: Address,
        _: ValidationId,
    ) -> Result<ValidatorConfig, EngineError> {
        // Installed: hook recorded as the sentinel.
        Ok(ValidatorConfig {
            nonce: 1,
            hook: address!("0000000000000000000000000000000000000001"),
        })
    }

    async fn root_validator(&self, _: Address) -> Result<ValidationId, EngineError> {
        Ok(ValidationId::default())
    }

    async fn root_hook(&self, _: Address) -> Result<Address, EngineError> {
        Ok(address!("0000000000000000000000000000000000000001"))
    }

    async fn domain_separator(&self, _: Address) -> Result<B256, EngineError> {
        Ok(keccak256(b"mock domain"))
    }

    async fn entry_point_deposit(&self, _: Address) -> Result<U256, EngineError> {
        Ok(self.state.lock().unwrap().deposit)
    }

    async fn allowed_tokens(&self, _: Address, _: PermissionId) -> Result<Vec<Address>, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.token_script.is_empty() {
            Ok(state.all_tokens.clone())
        } else {
            Ok(state.token_script.remove(0))
        }
    }

    async fn allowed_recipients(
        &self,
        _: Address,
        _: PermissionId,
    ) -> Result<Vec<Address>, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.recipient_script.is_empty() {
            Ok(state.all_recipients.clone())
        } else {
            Ok(state.recipient_script.remove(0))
        }
    }

    async fn operation_hash(&self, op: &PackedUserOperation) -> Result<B256, EngineError> {
        Ok(hash_user_operation(op, ENTRY_POINT_V07, 8453))
    }

    async fn estimate_operation_gas(
        &self,
        _: &UnpackedUserOperation,
    ) -> Result<GasEstimate, EngineError> {
        Err(EngineError::ChainRpc("no estimator in mock".into()))
    }

    async fn submit_operation(&self, op: &PackedUserOperation) -> Result<B256, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(op.clone());
        let (key, sequence) = decode_nonce(op.nonce);
        if state.confirm_submissions {
            state.sequences.insert((op.sender, key), sequence + 1);
        }
        Ok(keccak256((state.submissions.len() as u64).to_be_bytes()))
    }
}

struct MockSigner;

#[async_trait]
impl OperationSigner for MockSigner {
    async fn sign(&self, digest: B256, role: KeyRole) -> Result<Bytes, EngineError> {
        let mut sig = vec![match role {
            KeyRole::Root => 0x0a,
            KeyRole::Delegated => 0x0b,
        }];
        sig.extend_from_slice(digest.as_slice());
        sig.resize(65, 0x00);
        Ok(sig.into())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, StatusEvent)>>,
}

impl ProgressSink for RecordingSink {
    fn publish(&self, session_id: &str, event: StatusEvent) {
        self.events.lock().unwrap().push((session_id.to_string(), event));
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<String, DelegatedKeyRecord>>,
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<DelegatedKeyRecord>, EngineError> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }
    async fn save(&self, record: &DelegatedKeyRecord) -> Result<(), EngineError> {
        self.records.lock().unwrap().insert(record.id.clone(), record.clone());
        Ok(())
    }
    async fn update(&self, record: &DelegatedKeyRecord) -> Result<(), EngineError> {
        self.records.lock().unwrap().insert(record.id.clone(), record.clone());
        Ok(())
    }
    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
    async fn list(&self) -> Result<Vec<DelegatedKeyRecord>, EngineError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

struct Harness {
    chain: Arc<MockChain>,
    sink: Arc<RecordingSink>,
    store: Arc<MemoryStore>,
    engine: KernelEngine,
}

fn harness(chain: MockChain) -> Harness {
    let chain = Arc::new(chain);
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(MemoryStore::default());
    let mut config = EngineConfig::new(
        8453,
        address!("00000000000000000000000000000000000000a1"),
        address!("00000000000000000000000000000000000000a2"),
        address!("00000000000000000000000000000000000000a3"),
        address!("00000000000000000000000000000000000000a4"),
    );
    // Fast polling for tests.
    config.poll_interval = Duration::from_millis(1);
    config.confirm_polls = 3;
    config.retry.initial_interval = Duration::from_millis(1);
    config.retry.max_interval = Duration::from_millis(2);

    let engine = KernelEngine::new(
        chain.clone(),
        Arc::new(MockSigner),
        sink.clone(),
        store.clone(),
        config,
    );
    Harness { chain, sink, store, engine }
}

fn sudo_request() -> InstallRequest {
    InstallRequest {
        session_id: "session-1".to_string(),
        installation_id: "install-1".to_string(),
        account: ACCOUNT,
        delegate: DELEGATE,
        label: "test device".to_string(),
        key_type: KeyType::Sudo,
        policy: None,
    }
}

fn call_policy_request() -> InstallRequest {
    InstallRequest {
        key_type: KeyType::CallPolicy,
        policy: Some(CallPolicyRequest {
            allow_eth_transfer: true,
            eth_recipients: vec![format!("{RECIPIENT:#x}")],
            allow_erc20_transfer: true,
            tokens: vec![TokenLimitRequest {
                token: format!("{TOKEN:#x}"),
                decimals: 6,
                tx_limit: "100".to_string(),
                daily_limit: "500".to_string(),
            }],
            ..Default::default()
        }),
        ..sudo_request()
    }
}

#[tokio::test]
async fn sudo_install_completes_with_progress_events() {
    let h = harness(MockChain::new());
    let outcome = h.engine.install(sudo_request()).await.unwrap();

    let expected_id = permission_id(ACCOUNT, DELEGATE);
    assert_eq!(outcome.permission_id, expected_id);
    assert_eq!(outcome.vid, ValidationId::from_permission(expected_id));

    let events = h.sink.events.lock().unwrap();
    assert!(events.len() >= 3, "expected >=3 events, got {}", events.len());
    assert!(events.iter().all(|(session, _)| session == "session-1"));
    let last = &events.last().unwrap().1;
    assert_eq!(last.step, InstallStep::Completed);
    assert_eq!(last.progress, 100);
    assert_eq!(last.permission_id, Some(expected_id));
    assert_eq!(last.vid, Some(ValidationId::from_permission(expected_id)));

    // install + grant.
    assert_eq!(h.chain.submission_count(), 2);

    let record = h.store.records.lock().unwrap().get("install-1").cloned().unwrap();
    assert_eq!(record.status, InstallStep::Completed);
    assert_eq!(record.permission_id, expected_id);
}

#[tokio::test]
async fn call_policy_install_configures_limits() {
    let h = harness(MockChain::new());
    h.engine.install(call_policy_request()).await.unwrap();
    // install + grant + 1 recipient + 1 token limit.
    assert_eq!(h.chain.submission_count(), 4);
}

#[tokio::test]
async fn missing_recipient_is_resubmitted_exactly_once() {
    let chain = MockChain::new();
    {
        let mut state = chain.state.lock().unwrap();
        // First read-back: recipient missing. Second (after remediation): present.
        state.recipient_script = vec![vec![], vec![RECIPIENT]];
    }
    let h = harness(chain);
    h.engine.install(call_policy_request()).await.unwrap();
    // install + grant + recipient + token + exactly one recipient re-submit.
    assert_eq!(h.chain.submission_count(), 5);
}

#[tokio::test]
async fn persistently_missing_recipient_fails_with_not_persisted() {
    let chain = MockChain::new();
    {
        let mut state = chain.state.lock().unwrap();
        state.recipient_script = vec![vec![], vec![]];
    }
    let h = harness(chain);
    let err = h.engine.install(call_policy_request()).await.unwrap_err();
    match &err {
        EngineError::PersistencePartialFailure(msg) => {
            assert!(msg.contains("not persisted"), "message: {msg}")
        }
        other => panic!("expected PersistencePartialFailure, got {other:?}"),
    }

    let record = h.store.records.lock().unwrap().get("install-1").cloned().unwrap();
    assert_eq!(record.status, InstallStep::Failed);
    assert!(record.error.is_some());

    let events = h.sink.events.lock().unwrap();
    let last = &events.last().unwrap().1;
    assert_eq!(last.step, InstallStep::Failed);
    assert!(last.error.as_deref().unwrap().contains("not persisted"));
}

#[tokio::test]
async fn prefund_shortfall_fails_before_any_submission() {
    let chain = MockChain::new();
    chain.state.lock().unwrap().deposit = U256::from(1000u64);
    let h = harness(chain);
    let err = h.engine.install(sudo_request()).await.unwrap_err();
    match err {
        EngineError::PrefundShortfall { required, deposit, shortfall } => {
            assert_eq!(deposit, U256::from(1000u64));
            assert_eq!(shortfall, required - deposit);
        }
        other => panic!("expected PrefundShortfall, got {other:?}"),
    }
    // No nonce was consumed.
    assert_eq!(h.chain.submission_count(), 0);

    let record = h.store.records.lock().unwrap().get("install-1").cloned().unwrap();
    assert_eq!(record.status, InstallStep::Failed);
}

#[tokio::test]
async fn unconfirmed_submission_fails_as_timeout() {
    let chain = MockChain::new();
    chain.state.lock().unwrap().confirm_submissions = false;
    let h = harness(chain);
    let err = h.engine.install(sudo_request()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)), "got {err:?}");
    // Submitted once, never repeated.
    assert_eq!(h.chain.submission_count(), 1);
}

#[tokio::test]
async fn revoke_deletes_the_record() {
    let h = harness(MockChain::new());
    h.engine.install(sudo_request()).await.unwrap();
    assert_eq!(h.store.list().await.unwrap().len(), 1);

    h.engine.revoke("session-1", "install-1").await.unwrap();
    assert!(h.store.list().await.unwrap().is_empty());
    // install + grant + uninstall.
    assert_eq!(h.chain.submission_count(), 3);
}

#[tokio::test]
async fn enable_send_carries_hook_prefixed_enable_signature() {
    let h = harness(MockChain::new());
    h.engine
        .send_delegated_with_enable(ACCOUNT, DELEGATE, RECIPIENT, U256::from(1u64), &[])
        .await
        .unwrap();

    let state = h.chain.state.lock().unwrap();
    let op = state.submissions.last().unwrap();
    let (key, _) = decode_nonce(op.nonce);
    let id = permission_id(ACCOUNT, DELEGATE);
    assert_eq!(key, NonceKey::permission_enable(id));
    // Enable mode byte sits at the top of the lane key.
    assert_eq!(key.as_bytes()[0], 0x01);
    // Signature starts with the 20-byte sentinel hook address.
    assert_eq!(
        &op.signature[..20],
        address!("0000000000000000000000000000000000000001").as_slice()
    );
    assert!(op.signature.len() > 20);
}

#[tokio::test]
async fn delegated_send_uses_permission_lane_and_delegated_key() {
    let h = harness(MockChain::new());
    h.engine.install(sudo_request()).await.unwrap();

    let id = permission_id(ACCOUNT, DELEGATE);
    h.engine
        .send_delegated(ACCOUNT, id, RECIPIENT, U256::from(1u64), &[])
        .await
        .unwrap();

    let state = h.chain.state.lock().unwrap();
    let op = state.submissions.last().unwrap();
    let (key, _) = decode_nonce(op.nonce);
    assert_eq!(key, NonceKey::permission_default(id));
    // Permission-lane envelope around the delegated signature.
    assert_eq!(op.signature.len(), 75);
    assert_eq!(op.signature[0], 0x00);
    assert_eq!(op.signature[9], 0xff);
    assert_eq!(op.signature[10], 0x0b);
}
