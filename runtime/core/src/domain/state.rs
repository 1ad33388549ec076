// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # State & Log Events
//!
//! [`StateBase`] is the in-memory projection of an agent's log: the persisted
//! parent/child [`Topology`] plus the agent-type specific state. It changes only
//! by applying a [`StateLogEvent`], so topology changes are replayed exactly
//! like business mutations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::identity::AgentId;

/// Persisted parent/child adjacency of one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub parent: Option<AgentId>,
    pub children: BTreeSet<AgentId>,
}

impl Topology {
    pub fn has_child(&self, id: &AgentId) -> bool {
        self.children.contains(id)
    }

    pub fn is_child_of(&self, id: &AgentId) -> bool {
        self.parent.as_ref() == Some(id)
    }
}

/// One durable log record.
///
/// Topology variants are shared by every agent type; `Agent` carries the
/// agent-type specific mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StateLogEvent<E> {
    ParentSet { parent: AgentId },
    ParentCleared { parent: AgentId },
    ChildAdded { child: AgentId },
    ChildRemoved { child: AgentId },
    Agent(E),
}

impl<E> StateLogEvent<E> {
    pub fn kind(&self) -> &'static str {
        match self {
            StateLogEvent::ParentSet { .. } => "parent_set",
            StateLogEvent::ParentCleared { .. } => "parent_cleared",
            StateLogEvent::ChildAdded { .. } => "child_added",
            StateLogEvent::ChildRemoved { .. } => "child_removed",
            StateLogEvent::Agent(_) => "agent",
        }
    }
}

/// Projection of an agent's log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBase<S> {
    pub topology: Topology,
    pub state: S,
}

impl<S> StateBase<S> {
    /// Apply one log event. `transition` handles the agent-specific variant.
    pub fn apply<E>(&mut self, event: &StateLogEvent<E>, transition: impl FnOnce(&mut S, &E)) {
        match event {
            StateLogEvent::ParentSet { parent } => {
                self.topology.parent = Some(parent.clone());
            }
            StateLogEvent::ParentCleared { parent } => {
                // a stale clear must not detach a newer parent
                if self.topology.is_child_of(parent) {
                    self.topology.parent = None;
                }
            }
            StateLogEvent::ChildAdded { child } => {
                self.topology.children.insert(child.clone());
            }
            StateLogEvent::ChildRemoved { child } => {
                self.topology.children.remove(child);
            }
            StateLogEvent::Agent(e) => transition(&mut self.state, e),
        }
    }

    /// Fold `events` from the zero state.
    pub fn replay<'a, E: 'a>(
        events: impl IntoIterator<Item = &'a StateLogEvent<E>>,
        transition: impl Fn(&mut S, &E),
    ) -> Self
    where
        S: Default,
    {
        let mut base = Self::default();
        for event in events {
            base.apply(event, &transition);
        }
        base
    }
}
