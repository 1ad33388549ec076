// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Layered Relationship Manager
//!
//! Parent/child links live in both agents' event logs. Registration confirms
//! `ChildAdded` on the parent first and then asks the child (through the
//! [`AgentDirectory`]) to confirm `ParentSet`. There is no cross-agent
//! transaction: a failure between the two writes surfaces as
//! [`RelationshipError::PartialRegistration`] and is left for
//! [`RelationshipManager::validate`] to report.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::agent::Agent;
use super::event_log::EventLogEngine;
use crate::domain::error::AgentError;
use crate::domain::identity::AgentId;
use crate::domain::relationship::{AgentDirectory, RelationshipDiscrepancy, RelationshipError};
use crate::domain::state::{StateLogEvent, Topology};

pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Clone)]
pub struct RelationshipManager {
    directory: Arc<dyn AgentDirectory>,
    max_depth: usize,
}

impl RelationshipManager {
    pub fn new(directory: Arc<dyn AgentDirectory>, max_depth: usize) -> Self {
        Self { directory, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Register `child` under the agent owning `log`.
    ///
    /// Idempotent when both sides already record the link.
    pub async fn register<A: Agent>(
        &self,
        log: &mut EventLogEngine<A>,
        child: AgentId,
    ) -> Result<(), AgentError> {
        self.register_many(log, vec![child]).await
    }

    /// Register several children with one confirm on the parent.
    ///
    /// Every candidate is validated before anything is staged, so a rejected
    /// candidate leaves the parent untouched.
    pub async fn register_many<A: Agent>(
        &self,
        log: &mut EventLogEngine<A>,
        children: Vec<AgentId>,
    ) -> Result<(), AgentError> {
        let me = log.agent_id().clone();
        let candidates: BTreeSet<AgentId> = children.into_iter().collect();
        if candidates.is_empty() {
            return Ok(());
        }
        if candidates.contains(&me) {
            return Err(RelationshipError::SelfRegistration { agent_id: me }.into());
        }

        self.check_acyclic(&me, log.topology(), &candidates).await?;

        let mut needs_parent_set = Vec::new();
        for child in &candidates {
            let theirs = self.directory.topology_of(child).await?;
            match &theirs.parent {
                Some(existing) if existing != &me => {
                    return Err(RelationshipError::AlreadyHasParent {
                        child: child.clone(),
                        existing: existing.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None => needs_parent_set.push(child.clone()),
            }
        }

        let mut staged = 0;
        for child in &candidates {
            if !log.topology().has_child(child) {
                log.stage(StateLogEvent::ChildAdded { child: child.clone() });
                staged += 1;
            }
        }
        if staged > 0 {
            log.confirm().await?;
        } else if needs_parent_set.is_empty() {
            debug!(agent_id = %me, "Children already registered");
            return Ok(());
        }

        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for child in &needs_parent_set {
            if let Err(e) = self.directory.set_parent(child, &me).await {
                warn!(parent = %me, child = %child, error = %e, "Child did not record its parent");
                failed.push(child.clone());
                reasons.push(e.to_string());
            }
        }
        metrics::counter!("canopy_children_registered_total")
            .increment((candidates.len() - failed.len()) as u64);

        if failed.is_empty() {
            info!(parent = %me, children = candidates.len(), "Registered children");
            Ok(())
        } else {
            metrics::counter!("canopy_partial_registrations_total").increment(1);
            Err(RelationshipError::PartialRegistration {
                agent_id: me,
                counterparts: failed,
                reason: reasons.join("; "),
            }
            .into())
        }
    }

    /// Remove `child` from the agent owning `log`, then clear the child's
    /// parent. Unknown children are a no-op on the parent side.
    pub async fn unregister<A: Agent>(
        &self,
        log: &mut EventLogEngine<A>,
        child: &AgentId,
    ) -> Result<(), AgentError> {
        let me = log.agent_id().clone();
        let removed = log.topology().has_child(child);
        if removed {
            log.stage(StateLogEvent::ChildRemoved { child: child.clone() });
            log.confirm().await?;
        }

        match self.directory.clear_parent(child, &me).await {
            Ok(()) => {
                if removed {
                    info!(parent = %me, child = %child, "Unregistered child");
                }
                Ok(())
            }
            Err(e) if removed => {
                metrics::counter!("canopy_partial_registrations_total").increment(1);
                Err(RelationshipError::PartialRegistration {
                    agent_id: me,
                    counterparts: vec![child.clone()],
                    reason: e.to_string(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    /// Compare `topology` (owned by `agent_id`) against each counterpart.
    pub async fn validate(
        &self,
        agent_id: &AgentId,
        topology: &Topology,
    ) -> Result<Vec<RelationshipDiscrepancy>, AgentError> {
        let mut discrepancies = Vec::new();

        if let Some(parent) = &topology.parent {
            let theirs = self.directory.topology_of(parent).await?;
            if !theirs.has_child(agent_id) {
                discrepancies.push(RelationshipDiscrepancy::ParentMissingChild {
                    agent_id: agent_id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        for child in &topology.children {
            let theirs = self.directory.topology_of(child).await?;
            if !theirs.is_child_of(agent_id) {
                discrepancies.push(RelationshipDiscrepancy::ChildParentMismatch {
                    agent_id: agent_id.clone(),
                    child: child.clone(),
                    recorded_parent: theirs.parent,
                });
            }
        }

        if !discrepancies.is_empty() {
            warn!(agent_id = %agent_id, count = discrepancies.len(), "Relationship discrepancies found");
        }
        Ok(discrepancies)
    }

    /// [`validate`](Self::validate) for an agent looked up in the directory.
    pub async fn validate_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<RelationshipDiscrepancy>, AgentError> {
        let topology = self.directory.topology_of(agent_id).await?;
        self.validate(agent_id, &topology).await
    }

    /// Child side of registration: record `parent`.
    pub async fn accept_parent<A: Agent>(
        log: &mut EventLogEngine<A>,
        parent: AgentId,
    ) -> Result<(), AgentError> {
        match &log.topology().parent {
            Some(existing) if existing == &parent => Ok(()),
            Some(existing) => Err(RelationshipError::AlreadyHasParent {
                child: log.agent_id().clone(),
                existing: existing.clone(),
            }
            .into()),
            None => {
                log.stage(StateLogEvent::ParentSet { parent });
                log.confirm().await.map(|_| ())
            }
        }
    }

    /// Child side of unregistration: clear `parent` if it is still current.
    pub async fn release_parent<A: Agent>(
        log: &mut EventLogEngine<A>,
        parent: AgentId,
    ) -> Result<(), AgentError> {
        if log.topology().is_child_of(&parent) {
            log.stage(StateLogEvent::ParentCleared { parent });
            log.confirm().await?;
        }
        Ok(())
    }

    /// Walk up from `me` and reject any candidate found among its ancestors.
    async fn check_acyclic(
        &self,
        me: &AgentId,
        own: &Topology,
        candidates: &BTreeSet<AgentId>,
    ) -> Result<(), AgentError> {
        let mut depth = 0;
        let mut cursor = own.parent.clone();
        while let Some(ancestor) = cursor {
            if let Some(child) = candidates.get(&ancestor) {
                return Err(RelationshipError::CycleDetected {
                    parent: me.clone(),
                    child: child.clone(),
                }
                .into());
            }
            depth += 1;
            // the new children sit one level below `me`
            if depth + 1 > self.max_depth {
                return Err(RelationshipError::DepthExceeded {
                    agent_id: me.clone(),
                    max_depth: self.max_depth,
                }
                .into());
            }
            cursor = self.directory.topology_of(&ancestor).await?.parent;
        }
        Ok(())
    }
}
