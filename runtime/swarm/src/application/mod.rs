// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Application Layer
//!
//! [`SwarmService`] use cases over the activation runtime. Every operation
//! goes through the runtime's relationship commands, so each link write is a
//! turn on the agent that owns it.

use std::collections::{BTreeSet, VecDeque};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use canopy_core::domain::relationship::RelationshipDiscrepancy;
use canopy_core::{ActivationRuntime, AgentId};
use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::domain::{IntegrityReport, ReconcileOutcome, Swarm, Unresolved};

#[async_trait]
pub trait SwarmService: Send + Sync {
    /// Register `children` under `root` and return the resulting swarm.
    async fn create_swarm(&self, root: AgentId, children: Vec<AgentId>) -> Result<Swarm>;

    /// Read the current swarm rooted at `root`.
    async fn members(&self, root: &AgentId) -> Result<Swarm>;

    /// Validate every link in the swarm rooted at `root`.
    async fn audit(&self, root: &AgentId) -> Result<IntegrityReport>;

    /// Complete half-written links found by an audit.
    async fn reconcile(&self, report: &IntegrityReport) -> Result<ReconcileOutcome>;

    /// Unregister every link below `root`, leaves first. Returns the number
    /// of links removed.
    async fn dissolve(&self, root: &AgentId) -> Result<usize>;
}

pub struct StandardSwarmService {
    runtime: ActivationRuntime,
}

impl StandardSwarmService {
    pub fn new(runtime: ActivationRuntime) -> Self {
        Self { runtime }
    }

    /// Breadth-first `(parent, child)` links below `root`.
    async fn links(&self, root: &AgentId) -> Result<Vec<(AgentId, AgentId)>> {
        let max_depth = self.runtime.settings().max_depth;
        let mut seen = BTreeSet::from([root.clone()]);
        let mut queue = VecDeque::from([(root.clone(), 0usize)]);
        let mut links = Vec::new();

        while let Some((agent_id, depth)) = queue.pop_front() {
            let topology = self
                .runtime
                .topology_of(&agent_id)
                .await
                .with_context(|| format!("Failed to read topology of {agent_id}"))?;
            if topology.children.is_empty() {
                continue;
            }
            if depth >= max_depth {
                bail!("swarm rooted at {root} is deeper than {max_depth} levels");
            }
            for child in topology.children {
                if !seen.insert(child.clone()) {
                    warn!(parent = %agent_id, child = %child, "Child reached twice while walking swarm");
                    continue;
                }
                links.push((agent_id.clone(), child.clone()));
                queue.push_back((child, depth + 1));
            }
        }
        Ok(links)
    }

    async fn repair(&self, discrepancy: &RelationshipDiscrepancy) -> Result<(), String> {
        match discrepancy {
            // registration writes the parent side first: finish it
            RelationshipDiscrepancy::ChildParentMismatch {
                agent_id,
                child,
                recorded_parent: None,
            } => self
                .runtime
                .register_children(agent_id, vec![child.clone()])
                .await
                .map_err(|e| e.to_string()),
            RelationshipDiscrepancy::ChildParentMismatch {
                recorded_parent: Some(other),
                ..
            } => Err(format!("child is registered under {other}")),
            // unregistration clears the parent side first: finish it
            RelationshipDiscrepancy::ParentMissingChild { agent_id, parent } => self
                .runtime
                .unregister_child(parent, agent_id)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl SwarmService for StandardSwarmService {
    async fn create_swarm(&self, root: AgentId, children: Vec<AgentId>) -> Result<Swarm> {
        if !children.is_empty() {
            self.runtime
                .register_children(&root, children)
                .await
                .with_context(|| format!("Failed to register children under {root}"))?;
        }
        let swarm = self.members(&root).await?;
        info!(swarm_id = %swarm.id, root = %root, members = swarm.len(), "Created swarm");
        Ok(swarm)
    }

    async fn members(&self, root: &AgentId) -> Result<Swarm> {
        let members = self
            .links(root)
            .await?
            .into_iter()
            .map(|(_, child)| child)
            .collect();
        Ok(Swarm::new(root.clone(), members))
    }

    async fn audit(&self, root: &AgentId) -> Result<IntegrityReport> {
        let swarm = self.members(root).await?;
        let mut discrepancies = Vec::new();
        for member in &swarm.members {
            let found = self
                .runtime
                .validate_relationship(member)
                .await
                .with_context(|| format!("Failed to validate {member}"))?;
            for discrepancy in found {
                if !discrepancies.contains(&discrepancy) {
                    discrepancies.push(discrepancy);
                }
            }
        }

        if !discrepancies.is_empty() {
            counter!("canopy_swarm_discrepancies_total").increment(discrepancies.len() as u64);
            warn!(root = %root, count = discrepancies.len(), "Swarm audit found discrepancies");
        }
        Ok(IntegrityReport {
            root: root.clone(),
            checked: swarm.len(),
            discrepancies,
            generated_at: Utc::now(),
        })
    }

    async fn reconcile(&self, report: &IntegrityReport) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        for discrepancy in &report.discrepancies {
            match self.repair(discrepancy).await {
                Ok(()) => {
                    debug!(counterpart = %discrepancy.counterpart(), "Repaired relationship");
                    outcome.repaired.push(discrepancy.clone());
                }
                Err(reason) => {
                    warn!(counterpart = %discrepancy.counterpart(), reason = %reason, "Relationship left unresolved");
                    outcome.unresolved.push(Unresolved {
                        discrepancy: discrepancy.clone(),
                        reason,
                    });
                }
            }
        }

        counter!("canopy_swarm_repairs_total").increment(outcome.repaired.len() as u64);
        info!(
            root = %report.root,
            repaired = outcome.repaired.len(),
            unresolved = outcome.unresolved.len(),
            "Reconciled swarm"
        );
        Ok(outcome)
    }

    async fn dissolve(&self, root: &AgentId) -> Result<usize> {
        let links = self.links(root).await?;
        // breadth-first order reversed visits every child before its parent
        for (parent, child) in links.iter().rev() {
            self.runtime
                .unregister_child(parent, child)
                .await
                .with_context(|| format!("Failed to unregister {child} from {parent}"))?;
        }
        info!(root = %root, links = links.len(), "Dissolved swarm");
        Ok(links.len())
    }
}
