//! ERC-4337 v0.7 user-operation forms and the canonical operation hash.
//!
//! The packed form groups gas limits and fees into two 32-byte words as the
//! entry point expects; the unpacked form keeps scalar fields for transport
//! and signing. Hashing follows the entry point exactly:
//!
//! 1. Hash the variable-length fields: initCode, callData, paymasterAndData.
//! 2. abi.encode the struct with those hashes and the packed gas words.
//! 3. encodedHash = keccak256(step 2).
//! 4. final hash = keccak256(abi.encode(encodedHash, entryPoint, chainId)).

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolValue};
use serde::{Deserialize, Serialize};

use crate::packing::{
    pack_account_gas_limits, pack_gas_fees, unpack_account_gas_limits, unpack_gas_fees,
};

sol! {
    /// The entry point's packed v0.7 user-operation struct.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct PackedUserOperation {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes paymasterAndData;
        bytes signature;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct UserOperationPackedForHash {
        address sender;
        uint256 nonce;
        bytes32 hashInitCode;
        bytes32 hashCallData;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes32 hashPaymasterAndData;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct UserOperationHashEncoded {
        bytes32 encodedHash;
        address entryPoint;
        uint256 chainId;
    }
}

/// Unpacked v0.7 user operation with scalar gas fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpackedUserOperation {
    /// The kernel account sending the operation.
    pub sender: Address,
    /// Full 256-bit nonce: lane key << 64 | sequence.
    pub nonce: U256,
    /// Factory address ++ factory data, empty for deployed accounts.
    pub init_code: Bytes,
    /// The wrapped execute call.
    pub call_data: Bytes,
    /// Gas limit for the execution phase.
    pub call_gas_limit: u128,
    /// Gas limit for the verification phase.
    pub verification_gas_limit: u128,
    /// Gas paid to the bundler before verification.
    pub pre_verification_gas: u128,
    /// EIP-1559 max fee per gas.
    pub max_fee_per_gas: u128,
    /// EIP-1559 max priority fee per gas.
    pub max_priority_fee_per_gas: u128,
    /// Paymaster address ++ paymaster data, empty when self-funding.
    pub paymaster_and_data: Bytes,
    /// Validator signature, empty until signing.
    pub signature: Bytes,
}

impl UnpackedUserOperation {
    /// Converts to the entry point's packed form.
    pub fn pack(&self) -> PackedUserOperation {
        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            initCode: self.init_code.clone(),
            callData: self.call_data.clone(),
            accountGasLimits: pack_account_gas_limits(
                self.verification_gas_limit,
                self.call_gas_limit,
            ),
            preVerificationGas: U256::from(self.pre_verification_gas),
            gasFees: pack_gas_fees(self.max_priority_fee_per_gas, self.max_fee_per_gas),
            paymasterAndData: self.paymaster_and_data.clone(),
            signature: self.signature.clone(),
        }
    }

    /// Recovers the unpacked form from a packed operation.
    pub fn unpack(op: &PackedUserOperation) -> Self {
        let (verification_gas_limit, call_gas_limit) =
            unpack_account_gas_limits(op.accountGasLimits);
        let (max_priority_fee_per_gas, max_fee_per_gas) = unpack_gas_fees(op.gasFees);
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.initCode.clone(),
            call_data: op.callData.clone(),
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas: op.preVerificationGas.to::<u128>(),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data: op.paymasterAndData.clone(),
            signature: op.signature.clone(),
        }
    }
}

impl From<PackedUserOperation> for UserOperationPackedForHash {
    fn from(op: PackedUserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            hashInitCode: keccak256(op.initCode),
            hashCallData: keccak256(op.callData),
            accountGasLimits: op.accountGasLimits,
            preVerificationGas: op.preVerificationGas,
            gasFees: op.gasFees,
            hashPaymasterAndData: keccak256(op.paymasterAndData),
        }
    }
}

/// Computes the canonical v0.7 hash of a packed user operation, reproducing
/// the entry point's `getUserOpHash`.
pub fn hash_user_operation(
    user_operation: &PackedUserOperation,
    entry_point: Address,
    chain_id: u64,
) -> B256 {
    let packed = UserOperationPackedForHash::from(user_operation.clone());
    let encoded = UserOperationHashEncoded {
        encodedHash: keccak256(packed.abi_encode()),
        entryPoint: entry_point,
        chainId: U256::from(chain_id),
    };
    keccak256(encoded.abi_encode())
}
