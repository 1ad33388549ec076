// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Layered Communication Router
//!
//! Addresses envelopes using a committed [`Topology`] snapshot and hands them
//! to the [`Transport`]. Every operation is fire-and-forget: the router never
//! waits for downstream handlers.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::error::{DeliveryFailure, RouterError};
use crate::domain::events::{EventEnvelope, Route};
use crate::domain::identity::{AgentId, EventId};
use crate::domain::transport::Transport;

#[derive(Clone)]
pub struct LayeredRouter {
    agent_id: AgentId,
    transport: Arc<dyn Transport>,
}

impl LayeredRouter {
    pub fn new(agent_id: AgentId, transport: Arc<dyn Transport>) -> Self {
        Self { agent_id, transport }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Send to `parent`. Returns `false` (and sends nothing) for a root agent.
    pub async fn publish_upward(
        &self,
        parent: Option<&AgentId>,
        mut envelope: EventEnvelope,
    ) -> Result<bool, RouterError> {
        let Some(parent) = parent else {
            debug!(agent_id = %self.agent_id, event_type = %envelope.event_type, "No parent, upward publish skipped");
            return Ok(false);
        };
        envelope.route = Route::Upward;
        self.deliver(parent, envelope).await?;
        Ok(true)
    }

    /// One delivery attempt per child in `children`, in unspecified order.
    ///
    /// Every child is attempted even if an earlier one fails; the failures are
    /// reported together. Returns the number of children reached.
    pub async fn publish_downward(
        &self,
        children: &BTreeSet<AgentId>,
        mut envelope: EventEnvelope,
    ) -> Result<usize, RouterError> {
        envelope.route = Route::Downward;
        self.fan_out(children.iter(), &envelope).await
    }

    /// Enqueue onto this agent's own mailbox for a later turn.
    pub async fn publish_to_self(&self, mut envelope: EventEnvelope) -> Result<(), RouterError> {
        envelope.route = Route::ToSelf;
        let target = self.agent_id.clone();
        self.deliver(&target, envelope).await
    }

    /// Point-to-point delivery to any agent.
    pub async fn send_to(&self, target: &AgentId, mut envelope: EventEnvelope) -> Result<(), RouterError> {
        envelope.route = Route::PointToPoint;
        self.deliver(target, envelope).await
    }

    /// Re-address a received envelope to `targets`, keeping its event ID.
    ///
    /// Every target must be a current child; otherwise nothing is sent.
    pub async fn forward(
        &self,
        children: &BTreeSet<AgentId>,
        envelope: &EventEnvelope,
        targets: &[AgentId],
    ) -> Result<usize, RouterError> {
        if let Some(stranger) = targets.iter().find(|target| !children.contains(*target)) {
            return Err(RouterError::NotAChild {
                agent_id: self.agent_id.clone(),
                target: stranger.clone(),
            });
        }
        let forwarded = envelope.rerouted(Route::Downward);
        // a target listed twice still gets one attempt
        let unique: BTreeSet<&AgentId> = targets.iter().collect();
        self.fan_out(unique.into_iter(), &forwarded).await
    }

    async fn fan_out<'a>(
        &self,
        targets: impl Iterator<Item = &'a AgentId>,
        envelope: &EventEnvelope,
    ) -> Result<usize, RouterError> {
        let mut attempted = 0;
        let mut failures = Vec::new();
        for target in targets {
            attempted += 1;
            if let Err(RouterError::Delivery { target, reason }) =
                self.deliver(target, envelope.clone()).await
            {
                failures.push(DeliveryFailure { target, reason });
            }
        }

        let delivered = attempted - failures.len();
        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(RouterError::Fanout {
                attempted,
                delivered,
                failures,
            })
        }
    }

    async fn deliver(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), RouterError> {
        let route = envelope.route;
        let event_id: EventId = envelope.event_id;
        match self.transport.publish(target, envelope).await {
            Ok(()) => {
                metrics::counter!("canopy_envelopes_published_total", "route" => route.as_str())
                    .increment(1);
                debug!(
                    agent_id = %self.agent_id,
                    target = %target,
                    event_id = %event_id,
                    route = route.as_str(),
                    "Envelope published"
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!("canopy_publish_failures_total", "route" => route.as_str())
                    .increment(1);
                warn!(agent_id = %self.agent_id, target = %target, error = %e, "Publish failed");
                Err(RouterError::Delivery {
                    target: target.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
