// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent lifecycle value objects.

use serde::{Deserialize, Serialize};

/// Activation state machine.
///
/// `Uninitialized → Activating → Active → Deactivating → Deactivated`.
/// Only `Active` agents dispatch inbound envelopes; envelopes arriving while
/// `Activating` are queued until the transition completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Uninitialized,
    Activating,
    Active,
    Deactivating,
    Deactivated,
}

impl AgentStatus {
    /// Whether the activation still accepts mailbox items.
    pub fn accepts_work(&self) -> bool {
        matches!(
            self,
            AgentStatus::Uninitialized | AgentStatus::Activating | AgentStatus::Active
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Deactivated)
    }
}

/// Why an activation was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// Explicit `deactivate` call.
    Requested,
    /// No mailbox activity within the configured idle timeout.
    Idle,
    /// Runtime shutdown.
    Shutdown,
    /// Activation hook or replay failed.
    ActivationFailed,
}

impl std::fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeactivationReason::Requested => "requested",
            DeactivationReason::Idle => "idle",
            DeactivationReason::Shutdown => "shutdown",
            DeactivationReason::ActivationFailed => "activation_failed",
        };
        f.write_str(s)
    }
}
