#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod builder;
pub use builder::{BuiltOperation, OperationBuilder};

pub mod chain;
pub use chain::{GasEstimate, KernelChainClient, ValidatorConfig};

pub mod config;
pub use config::{EngineConfig, GasCeilings, RetryPolicy, ENTRY_POINT_V07};

pub mod enable;
pub use enable::{enable_digest, resolve_config_nonce};

pub mod error;
pub use error::EngineError;

pub mod events;
pub use events::{InstallStep, ProgressSink, StatusEvent};

pub mod identifiers;
pub use identifiers::{permission_id, PermissionId, ValidationId};

pub mod kernel;

pub mod nonce;
pub use nonce::{encode_nonce, decode_nonce, LaneLocks, NonceKey};

pub mod orchestrator;
pub use orchestrator::{InstallOutcome, InstallRequest, KernelEngine};

pub mod packing;

pub mod policy;
pub use policy::{CallPolicyRequest, CallPolicySettings, Permission, TokenLimit};

pub mod prefund;
pub use prefund::{ensure_prefunded, required_prefund};

pub mod signer;
pub use signer::{KeyRole, OperationSigner};

pub mod store;
pub use store::{DelegatedKeyRecord, KeyStore, KeyType};

pub mod userop;
pub use userop::{hash_user_operation, PackedUserOperation, UnpackedUserOperation};
