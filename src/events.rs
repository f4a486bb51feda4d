//! Installation progress events and the progress-sink capability.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::identifiers::{PermissionId, ValidationId};

/// Steps of the installation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStep {
    /// Waiting to start.
    Idle,
    /// Submitting the validator installation.
    Installing,
    /// Granting selector access to the new validation.
    Granting,
    /// Call-policy only: configuring recipients and token limits.
    SettingLimits,
    /// Confirming on-chain state before completion.
    Verifying,
    /// Terminal: installed and verified.
    Completed,
    /// Terminal: the flow failed; restart with a fresh installation id.
    Failed,
}

impl InstallStep {
    /// True for states no transition leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A progress update published to the external subscriber.
///
/// Delivery is at-most-once and fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// The step the flow just entered.
    pub step: InstallStep,
    /// Human-readable progress message.
    pub message: String,
    /// 0-100.
    pub progress: u8,
    /// Submission hash of the step's operation, when one was submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    /// Classified error message, present only on [`InstallStep::Failed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The resolved permission id, populated on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<PermissionId>,
    /// The resolved validation id, populated on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<ValidationId>,
}

impl StatusEvent {
    /// A plain step event.
    pub fn step(step: InstallStep, message: impl Into<String>, progress: u8) -> Self {
        Self {
            step,
            message: message.into(),
            progress,
            tx_hash: None,
            error: None,
            permission_id: None,
            vid: None,
        }
    }

    /// Attaches a submission hash.
    pub fn with_tx_hash(mut self, tx_hash: B256) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }
}

/// Injected progress publisher, keyed by a caller-supplied session id.
pub trait ProgressSink: Send + Sync {
    /// Publishes one event; no delivery guarantee is assumed.
    fn publish(&self, session_id: &str, event: StatusEvent);
}
