// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Stream Transport
//
// One logical stream per agent identity. Publishing invokes every handler
// subscribed to the target; delivery into a mailbox is the only work done on
// the publisher's task. Envelopes for identities with no live subscription go
// to the registered UndeliveredHandler (the runtime, which activates the
// target on demand).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::events::EventEnvelope;
use crate::domain::identity::AgentId;
use crate::domain::transport::{
    EnvelopeHandler, SubscriptionHandle, Transport, TransportError, UndeliveredHandler,
};

#[derive(Clone, Default)]
pub struct InMemoryStreamTransport {
    streams: Arc<DashMap<AgentId, Vec<(Uuid, EnvelopeHandler)>>>,
    undelivered: Arc<RwLock<Option<Weak<dyn UndeliveredHandler>>>>,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `agent_id`'s stream.
    pub fn subscriber_count(&self, agent_id: &AgentId) -> usize {
        self.streams.get(agent_id).map(|s| s.len()).unwrap_or(0)
    }

    async fn hand_off(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), TransportError> {
        let handler = self.undelivered.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.undelivered(target, envelope).await,
            None => {
                metrics::counter!("canopy_envelopes_dropped_total", "reason" => "no_subscriber")
                    .increment(1);
                debug!(target = %target, event_type = %envelope.event_type, "No subscriber, envelope dropped");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryStreamTransport {
    async fn subscribe(
        &self,
        agent_id: &AgentId,
        handler: EnvelopeHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        let id = Uuid::new_v4();
        self.streams
            .entry(agent_id.clone())
            .or_default()
            .push((id, handler));
        debug!(agent_id = %agent_id, subscription = %id, "Subscribed to stream");
        Ok(SubscriptionHandle {
            agent_id: agent_id.clone(),
            id,
        })
    }

    async fn publish(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), TransportError> {
        // never await while holding a map shard
        let handlers: Vec<EnvelopeHandler> = self
            .streams
            .get(target)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            return self.hand_off(target, envelope).await;
        }

        let mut accepted = 0;
        let mut last_error = None;
        for handler in handlers {
            match handler(envelope.clone()).await {
                Ok(()) => accepted += 1,
                Err(TransportError::Closed(_)) => {}
                Err(e) => last_error = Some(e),
            }
        }

        match (accepted, last_error) {
            (0, Some(e)) => Err(e),
            // every subscriber is shutting down
            (0, None) => self.hand_off(target, envelope).await,
            (_, Some(e)) => {
                warn!(target = %target, error = %e, "Envelope reached only some subscribers");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        if let Some(mut subs) = self.streams.get_mut(&handle.agent_id) {
            subs.retain(|(id, _)| *id != handle.id);
        }
        self.streams.remove_if(&handle.agent_id, |_, subs| subs.is_empty());
        debug!(agent_id = %handle.agent_id, subscription = %handle.id, "Unsubscribed from stream");
        Ok(())
    }

    fn set_undelivered_handler(&self, handler: Weak<dyn UndeliveredHandler>) {
        *self.undelivered.write() = Some(handler);
    }
}
