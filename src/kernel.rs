//! Kernel account and policy-module contract bindings.
//!
//! Selectors are derived from the `sol!` definitions below; the only
//! hardcoded constant is the entry point's `executeUserOp` dispatch selector.

use alloy_primitives::{address, Address, Bytes, B256};
use alloy_sol_types::{sol, SolValue};

use crate::identifiers::ValidationId;

sol! {
    /// Per-validator configuration stored by the kernel.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct ValidationConfig {
        uint32 nonce;
        address hook;
    }

    /// A policy contract plus its initialization payload.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct PolicyEntry {
        address policy;
        bytes initData;
    }

    /// The signer contract checking the delegated key, plus its payload.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct SignerEntry {
        address signer;
        bytes initData;
    }

    /// ERC-7579 execute entry on the kernel account.
    function execute(bytes32 execMode, bytes executionCalldata);

    /// Installs one or more validations on the kernel (self-call, root lane).
    function installValidations(
        bytes21[] vIds,
        ValidationConfig[] configs,
        bytes[] validationData,
        bytes[] hookData
    );

    /// Removes a validation and its permission scope.
    function uninstallValidation(bytes21 vId, bytes deinitData, bytes hookDeinitData);

    /// Allows or disallows a validation to invoke a kernel selector.
    function grantAccess(bytes21 vId, bytes4 selector, bool allow);

    /// Entry-point deposit call, used for prefund top-ups.
    function depositTo(address account) payable;

    /// Call-policy configuration: per-token spend limits.
    function setTokenLimit(
        bytes4 permissionId,
        address token,
        uint256 txLimit,
        uint256 dailyLimit,
        bool enabled
    );

    /// Call-policy configuration: recipient allow list.
    function setRecipientAllowed(bytes4 permissionId, address recipient, bool allowed);

    /// Call-policy configuration: selector allow list.
    function setSelectorAllowed(bytes4 permissionId, bytes4 selector, bool allowed);
}

/// Entry-point dispatch selector for `executeUserOp(PackedUserOperation,bytes32)`.
pub const EXECUTE_USER_OP_SELECTOR: [u8; 4] = [0x8d, 0xd7, 0x71, 0x2f];

/// The kernel's "no hook installed" sentinel, `address(1)`.
pub const HOOK_SENTINEL: Address = address!("0000000000000000000000000000000000000001");

/// Encodes the validator-data payload for a permission installation:
/// the ordered policy list plus the signer entry for the delegated key.
pub fn encode_permission_init_data(
    policies: &[(Address, Bytes)],
    signer: Address,
    delegate: Address,
) -> Bytes {
    let policies: Vec<PolicyEntry> = policies
        .iter()
        .map(|(policy, data)| PolicyEntry { policy: *policy, initData: data.clone() })
        .collect();
    let signer =
        SignerEntry { signer, initData: Bytes::copy_from_slice(delegate.as_slice()) };
    (policies, signer).abi_encode().into()
}

/// Encodes the kernel self-call installing a single validation.
pub fn encode_install_validation(
    vid: ValidationId,
    config_nonce: u32,
    hook: Address,
    validator_data: Bytes,
    hook_data: Bytes,
) -> Bytes {
    use alloy_sol_types::SolCall;
    installValidationsCall {
        vIds: vec![vid.into_inner()],
        configs: vec![ValidationConfig { nonce: config_nonce, hook }],
        validationData: vec![validator_data],
        hookData: vec![hook_data],
    }
    .abi_encode()
    .into()
}

/// Execution mode word for a single (non-batch, non-delegate) call.
pub const EXEC_MODE_SINGLE: B256 = B256::ZERO;
