// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Relationship Contracts
//!
//! - [`RelationshipError`]: registrations rejected before any log write, or
//!   left half-applied across two agents.
//! - [`RelationshipDiscrepancy`]: disagreement found by on-demand validation.
//! - [`AgentDirectory`]: port used to read and update the counterpart agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::AgentError;
use super::identity::AgentId;
use super::state::Topology;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelationshipError {
    #[error("{agent_id} cannot register itself as a child")]
    SelfRegistration { agent_id: AgentId },

    #[error("registering {child} under {parent} would create a cycle")]
    CycleDetected { parent: AgentId, child: AgentId },

    #[error("ancestor chain of {agent_id} exceeds the maximum depth of {max_depth}")]
    DepthExceeded { agent_id: AgentId, max_depth: usize },

    #[error("{child} already has parent {existing}")]
    AlreadyHasParent { child: AgentId, existing: AgentId },

    /// The local side was confirmed but the counterpart write failed.
    #[error("{agent_id} updated its own log but not the counterpart(s) {counterparts:?}: {reason}")]
    PartialRegistration {
        agent_id: AgentId,
        counterparts: Vec<AgentId>,
        reason: String,
    },
}

/// Disagreement between two agents' recorded links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipDiscrepancy {
    /// `agent_id` names `parent` as its parent, but `parent` does not list it.
    ParentMissingChild { agent_id: AgentId, parent: AgentId },
    /// `agent_id` lists `child`, but `child` records a different (or no) parent.
    ChildParentMismatch {
        agent_id: AgentId,
        child: AgentId,
        recorded_parent: Option<AgentId>,
    },
}

impl RelationshipDiscrepancy {
    /// The agent whose log is missing the link.
    pub fn counterpart(&self) -> &AgentId {
        match self {
            RelationshipDiscrepancy::ParentMissingChild { parent, .. } => parent,
            RelationshipDiscrepancy::ChildParentMismatch { child, .. } => child,
        }
    }
}

/// Access to other agents' committed topology.
///
/// Reads never enter the counterpart's turn; writes run as a turn on the
/// counterpart so its single-writer discipline holds.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Committed topology of `agent_id`, activating it on demand.
    async fn topology_of(&self, agent_id: &AgentId) -> Result<Topology, AgentError>;

    /// Record `parent` as the parent of `child`.
    async fn set_parent(&self, child: &AgentId, parent: &AgentId) -> Result<(), AgentError>;

    /// Clear `parent` from `child` if it is still the recorded parent.
    async fn clear_parent(&self, child: &AgentId, parent: &AgentId) -> Result<(), AgentError>;
}
