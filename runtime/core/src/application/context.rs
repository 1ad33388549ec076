// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Context
//!
//! [`AgentContext`] is the single-writer view of one activation handed to
//! mutating handlers: the mutation API (`stage`, `confirm`, `state`), the
//! layered publish API and the topology API. Every publish is refused while
//! staged events are unconfirmed, so nothing leaves the agent for a mutation
//! that could still be lost.
//!
//! [`ReadOnlyContext`] is the snapshot view handed to read-only handlers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::agent::Agent;
use super::correlator::{Correlator, PendingResponse, ResponseOutcome, ResponseRoute};
use super::event_log::EventLogEngine;
use super::relationship::RelationshipManager;
use super::router::LayeredRouter;
use crate::domain::error::AgentError;
use crate::domain::events::{BusinessEvent, Correlation, EventEnvelope, Route};
use crate::domain::identity::{AgentId, CorrelationId};
use crate::domain::relationship::RelationshipDiscrepancy;
use crate::domain::state::{StateBase, StateLogEvent, Topology};

pub struct AgentContext<A: Agent> {
    agent: A,
    pub(crate) log: EventLogEngine<A>,
    pub(crate) router: LayeredRouter,
    pub(crate) relationships: RelationshipManager,
    pub(crate) correlator: Arc<Correlator>,
    default_timeout: Duration,
}

impl<A: Agent> AgentContext<A> {
    pub fn new(
        agent: A,
        log: EventLogEngine<A>,
        router: LayeredRouter,
        relationships: RelationshipManager,
        correlator: Arc<Correlator>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            log,
            router,
            relationships,
            correlator,
            default_timeout,
        }
    }

    pub fn id(&self) -> &AgentId {
        self.log.agent_id()
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    // ---- mutation API ----

    /// Committed state.
    pub fn state(&self) -> &A::State {
        self.log.state()
    }

    /// State including events staged in this turn.
    pub fn staged_state(&self) -> &A::State {
        self.log.staged_state()
    }

    pub fn committed(&self) -> Arc<StateBase<A::State>> {
        self.log.committed()
    }

    pub fn version(&self) -> u64 {
        self.log.version()
    }

    pub fn pending_events(&self) -> usize {
        self.log.pending_len()
    }

    pub fn stage(&mut self, event: A::LogEvent) {
        self.log.stage(StateLogEvent::Agent(event));
    }

    pub async fn confirm(&mut self) -> Result<u64, AgentError> {
        self.log.confirm().await
    }

    pub fn discard_pending(&mut self) -> usize {
        self.log.discard_pending()
    }

    // ---- topology reads ----

    pub fn topology(&self) -> &Topology {
        self.log.topology()
    }

    pub fn parent(&self) -> Option<&AgentId> {
        self.log.topology().parent.as_ref()
    }

    pub fn children(&self) -> &BTreeSet<AgentId> {
        &self.log.topology().children
    }

    // ---- publishing ----

    fn ensure_confirmed(&self) -> Result<(), AgentError> {
        match self.log.pending_len() {
            0 => Ok(()),
            pending => Err(AgentError::UnconfirmedEvents {
                agent_id: self.id().clone(),
                pending,
            }),
        }
    }

    fn envelope<E: BusinessEvent>(&self, event: &E, route: Route) -> Result<EventEnvelope, AgentError> {
        self.ensure_confirmed()?;
        Ok(EventEnvelope::new(event, self.id().clone(), route)?)
    }

    /// Upward when the agent has a parent, to self otherwise.
    pub async fn publish<E: BusinessEvent>(&self, event: &E) -> Result<(), AgentError> {
        if self.parent().is_some() {
            self.publish_upward(event).await.map(|_| ())
        } else {
            self.publish_to_self(event).await
        }
    }

    /// Returns `false` when there is no parent to publish to.
    pub async fn publish_upward<E: BusinessEvent>(&self, event: &E) -> Result<bool, AgentError> {
        let envelope = self.envelope(event, Route::Upward)?;
        Ok(self.router.publish_upward(self.parent(), envelope).await?)
    }

    /// Fan out to the children committed at call time. Returns the number of
    /// children reached.
    pub async fn publish_downward<E: BusinessEvent>(&self, event: &E) -> Result<usize, AgentError> {
        let envelope = self.envelope(event, Route::Downward)?;
        Ok(self.router.publish_downward(self.children(), envelope).await?)
    }

    /// Handle `event` in a later turn of this agent.
    pub async fn publish_to_self<E: BusinessEvent>(&self, event: &E) -> Result<(), AgentError> {
        let envelope = self.envelope(event, Route::ToSelf)?;
        Ok(self.router.publish_to_self(envelope).await?)
    }

    /// Point-to-point delivery to any agent.
    pub async fn send_to<E: BusinessEvent>(&self, target: &AgentId, event: &E) -> Result<(), AgentError> {
        let envelope = self.envelope(event, Route::PointToPoint)?;
        Ok(self.router.send_to(target, envelope).await?)
    }

    /// Re-address a received envelope to some children, keeping its event ID.
    pub async fn forward(&self, envelope: &EventEnvelope, targets: &[AgentId]) -> Result<usize, AgentError> {
        self.ensure_confirmed()?;
        Ok(self.router.forward(self.children(), envelope, targets).await?)
    }

    /// Re-address a received envelope to every child.
    pub async fn forward_downward(&self, envelope: &EventEnvelope) -> Result<usize, AgentError> {
        let targets: Vec<AgentId> = self.children().iter().cloned().collect();
        self.forward(envelope, &targets).await
    }

    /// Requests still waiting for a reply.
    pub fn pending_correlations(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn is_awaiting(&self, correlation_id: &CorrelationId) -> bool {
        self.correlator.is_pending(correlation_id)
    }

    /// Publish a correlated request and return its continuation without
    /// waiting.
    pub async fn publish_request<E: BusinessEvent>(
        &self,
        event: &E,
        route: ResponseRoute,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, AgentError> {
        let envelope_route = match route {
            ResponseRoute::Upward => Route::Upward,
            ResponseRoute::Downward => Route::Downward,
            ResponseRoute::To(_) => Route::PointToPoint,
        };
        let envelope = self.envelope(event, envelope_route)?;
        let pending = self
            .correlator
            .register(timeout.unwrap_or(self.default_timeout));
        let envelope = envelope.with_correlation(Correlation::Request {
            id: pending.correlation_id(),
            reply_to: self.id().clone(),
        });

        let published = match &route {
            ResponseRoute::Upward => self.router.publish_upward(self.parent(), envelope).await.map(|_| ()),
            ResponseRoute::Downward => self.router.publish_downward(self.children(), envelope).await.map(|_| ()),
            ResponseRoute::To(target) => self.router.send_to(target, envelope).await,
        };
        if let Err(e) = published {
            self.correlator.abandon(pending.correlation_id());
            return Err(e.into());
        }
        Ok(pending)
    }

    /// Publish a correlated request and wait for the reply, the deadline or
    /// deactivation.
    pub async fn publish_with_response<E: BusinessEvent>(
        &self,
        event: &E,
        route: ResponseRoute,
        timeout: Option<Duration>,
    ) -> Result<ResponseOutcome, AgentError> {
        let pending = self.publish_request(event, route, timeout).await?;
        Ok(pending.wait().await)
    }

    /// Answer `request`. Correlated requests get a point-to-point reply;
    /// uncorrelated ones have the response published normally.
    pub async fn reply<E: BusinessEvent>(&self, request: &EventEnvelope, response: &E) -> Result<(), AgentError> {
        match &request.correlation {
            Some(Correlation::Request { id, reply_to }) => {
                let envelope = self
                    .envelope(response, Route::PointToPoint)?
                    .with_correlation(Correlation::Reply { id: *id });
                Ok(self.router.send_to(reply_to, envelope).await?)
            }
            _ => self.publish(response).await,
        }
    }

    // ---- topology writes ----

    pub async fn register_child(&mut self, child: AgentId) -> Result<(), AgentError> {
        self.ensure_confirmed()?;
        self.relationships.register(&mut self.log, child).await
    }

    /// Register several children with a single confirm on this agent.
    pub async fn register_children(&mut self, children: Vec<AgentId>) -> Result<(), AgentError> {
        self.ensure_confirmed()?;
        self.relationships.register_many(&mut self.log, children).await
    }

    pub async fn unregister_child(&mut self, child: &AgentId) -> Result<(), AgentError> {
        self.ensure_confirmed()?;
        self.relationships.unregister(&mut self.log, child).await
    }

    /// Cross-check this agent's links against its counterparts.
    pub async fn validate_relationship(&self) -> Result<Vec<RelationshipDiscrepancy>, AgentError> {
        self.relationships.validate(self.id(), self.topology()).await
    }

    pub(crate) async fn accept_parent(&mut self, parent: AgentId) -> Result<(), AgentError> {
        self.ensure_confirmed()?;
        RelationshipManager::accept_parent(&mut self.log, parent).await
    }

    pub(crate) async fn release_parent(&mut self, parent: AgentId) -> Result<(), AgentError> {
        self.ensure_confirmed()?;
        RelationshipManager::release_parent(&mut self.log, parent).await
    }

    /// Snapshot view for read-only handlers.
    pub fn read_only(&self) -> ReadOnlyContext<A> {
        ReadOnlyContext {
            state: self.log.committed(),
            version: self.log.version(),
            router: self.router.clone(),
        }
    }
}

/// Committed-state snapshot plus the publish API. Cannot stage events.
pub struct ReadOnlyContext<A: Agent> {
    state: Arc<StateBase<A::State>>,
    version: u64,
    router: LayeredRouter,
}

impl<A: Agent> Clone for ReadOnlyContext<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            version: self.version,
            router: self.router.clone(),
        }
    }
}

impl<A: Agent> ReadOnlyContext<A> {
    pub fn id(&self) -> &AgentId {
        self.router.agent_id()
    }

    pub fn state(&self) -> &A::State {
        &self.state.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn parent(&self) -> Option<&AgentId> {
        self.state.topology.parent.as_ref()
    }

    pub fn children(&self) -> &BTreeSet<AgentId> {
        &self.state.topology.children
    }

    pub async fn publish_upward<E: BusinessEvent>(&self, event: &E) -> Result<bool, AgentError> {
        let envelope = EventEnvelope::new(event, self.id().clone(), Route::Upward)?;
        Ok(self.router.publish_upward(self.parent(), envelope).await?)
    }

    pub async fn publish_downward<E: BusinessEvent>(&self, event: &E) -> Result<usize, AgentError> {
        let envelope = EventEnvelope::new(event, self.id().clone(), Route::Downward)?;
        Ok(self.router.publish_downward(self.children(), envelope).await?)
    }

    pub async fn send_to<E: BusinessEvent>(&self, target: &AgentId, event: &E) -> Result<(), AgentError> {
        let envelope = EventEnvelope::new(event, self.id().clone(), Route::PointToPoint)?;
        Ok(self.router.send_to(target, envelope).await?)
    }
}
