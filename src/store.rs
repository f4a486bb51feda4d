//! Delegated-key records and the persistence capability.
//!
//! The store is invoked only at defined lifecycle points: create when
//! Installing starts, update at each transition, delete on revoke.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::events::InstallStep;
use crate::identifiers::{PermissionId, ValidationId};

/// The kind of delegated key installed on the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    /// Unrestricted (sudo-policy) delegated key.
    Sudo,
    /// Call-policy restricted delegated key.
    CallPolicy,
}

/// A locally persisted record of one delegated key installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedKeyRecord {
    /// Caller-assigned record id.
    pub id: String,
    /// Human-readable device label.
    pub label: String,
    /// Sudo or call-policy.
    pub key_type: KeyType,
    /// The kernel account the key is installed on.
    pub account: Address,
    /// The delegated key's public address.
    pub address: Address,
    /// Derived 4-byte permission id.
    pub permission_id: PermissionId,
    /// Derived 21-byte validation id.
    pub vid: ValidationId,
    /// Current lifecycle step.
    pub status: InstallStep,
    /// Hash of the most recent submission for this record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_hash: Option<B256>,
    /// Raw error preserved when the flow failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Injected persistence capability for delegated-key records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetches a record by id.
    async fn get(&self, id: &str) -> Result<Option<DelegatedKeyRecord>, EngineError>;
    /// Creates a record.
    async fn save(&self, record: &DelegatedKeyRecord) -> Result<(), EngineError>;
    /// Replaces a record.
    async fn update(&self, record: &DelegatedKeyRecord) -> Result<(), EngineError>;
    /// Deletes a record by id.
    async fn delete(&self, id: &str) -> Result<(), EngineError>;
    /// Lists all records.
    async fn list(&self) -> Result<Vec<DelegatedKeyRecord>, EngineError>;
}
