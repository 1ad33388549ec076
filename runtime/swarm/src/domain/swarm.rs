// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Value Types
//!
//! - [`Swarm`]: a root agent and the descendants reachable from it.
//! - [`SwarmId`]: unique identifier (UUID newtype).
//! - [`IntegrityReport`]: result of auditing every link in a swarm.
//! - [`ReconcileOutcome`]: which discrepancies a reconcile pass repaired.

use canopy_core::domain::relationship::RelationshipDiscrepancy;
use canopy_core::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a [`Swarm`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    /// Generate a new random `SwarmId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A root agent and every descendant reachable through committed `children`.
///
/// # Invariants
///
/// - `members` always contains `root`.
/// - Membership is a snapshot taken when the swarm was read; the agents' logs
///   remain the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swarm {
    pub id: SwarmId,
    pub root: AgentId,
    pub members: BTreeSet<AgentId>,
    pub created_at: DateTime<Utc>,
}

impl Swarm {
    pub fn new(root: AgentId, mut members: BTreeSet<AgentId>) -> Self {
        members.insert(root.clone());
        Self {
            id: SwarmId::new(),
            root,
            members,
            created_at: Utc::now(),
        }
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.members.contains(agent_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Findings of an audit over one swarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub root: AgentId,
    /// Agents whose links were validated.
    pub checked: usize,
    pub discrepancies: Vec<RelationshipDiscrepancy>,
    pub generated_at: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// A discrepancy that reconcile could not repair, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unresolved {
    pub discrepancy: RelationshipDiscrepancy,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub repaired: Vec<RelationshipDiscrepancy>,
    pub unresolved: Vec<Unresolved>,
}

impl ReconcileOutcome {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}
