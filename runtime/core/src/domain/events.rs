// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelopes & Runtime Events
//!
//! - [`BusinessEvent`]: a serialisable event type with a stable dispatch name.
//! - [`EventEnvelope`]: the routed, cross-agent message carrying one business event.
//! - [`HandlerFailed`]: built-in event reported back when a handler turn fails.
//! - [`RuntimeEvent`]: lifecycle notifications published on the runtime event bus.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::agent::DeactivationReason;
use super::identity::{AgentId, CorrelationId, EventId};

/// A business event that can travel between agents.
///
/// `EVENT_TYPE` is the dispatch key: handlers are looked up by this name, so it
/// must stay stable across releases.
pub trait BusinessEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Direction an envelope travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Upward,
    Downward,
    ToSelf,
    PointToPoint,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Upward => "upward",
            Route::Downward => "downward",
            Route::ToSelf => "to_self",
            Route::PointToPoint => "point_to_point",
        }
    }
}

/// Request/response metadata carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correlation {
    /// The publisher awaits a reply addressed to `reply_to`.
    Request { id: CorrelationId, reply_to: AgentId },
    /// Answer to a previously issued request.
    Reply { id: CorrelationId },
}

impl Correlation {
    pub fn id(&self) -> CorrelationId {
        match self {
            Correlation::Request { id, .. } | Correlation::Reply { id } => *id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode '{event_type}': {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode '{event_type}': {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("envelope carries '{found}', expected '{expected}'")]
    TypeMismatch { expected: String, found: String },
}

/// Routed message wrapping one business event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub publisher: AgentId,
    pub route: Route,
    pub correlation: Option<Correlation>,
    pub published_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap `event` with a fresh event ID.
    pub fn new<E: BusinessEvent>(
        event: &E,
        publisher: AgentId,
        route: Route,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(event).map_err(|source| EnvelopeError::Encode {
            event_type: E::EVENT_TYPE.to_string(),
            source,
        })?;
        Ok(Self {
            event_id: EventId::new(),
            event_type: E::EVENT_TYPE.to_string(),
            payload,
            publisher,
            route,
            correlation: None,
            published_at: Utc::now(),
        })
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Copy re-addressed along `route`, keeping the event ID.
    pub fn rerouted(&self, route: Route) -> Self {
        Self {
            route,
            ..self.clone()
        }
    }

    pub fn is<E: BusinessEvent>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    pub fn decode<E: BusinessEvent>(&self) -> Result<E, EnvelopeError> {
        if !self.is::<E>() {
            return Err(EnvelopeError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                found: self.event_type.clone(),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|source| EnvelopeError::Decode {
            event_type: self.event_type.clone(),
            source,
        })
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation.as_ref().map(Correlation::id)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.correlation, Some(Correlation::Reply { .. }))
    }

    /// Key under which a successfully handled delivery is remembered.
    pub fn dedup_key(&self) -> DedupKey {
        (self.correlation_id(), self.event_id)
    }
}

pub type DedupKey = (Option<CorrelationId>, EventId);

/// Sent to the publisher (or as the reply to a request) when a handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailed {
    pub agent_id: AgentId,
    pub event_type: String,
    pub event_id: EventId,
    pub reason: String,
}

impl BusinessEvent for HandlerFailed {
    const EVENT_TYPE: &'static str = "canopy.handler_failed";
}

/// Notifications published on the runtime event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    AgentActivated {
        agent_id: AgentId,
        version: u64,
        activated_at: DateTime<Utc>,
    },
    ActivationFailed {
        agent_id: AgentId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    AgentDeactivated {
        agent_id: AgentId,
        reason: DeactivationReason,
        deactivated_at: DateTime<Utc>,
    },
    StateConfirmed {
        agent_id: AgentId,
        version: u64,
        event_count: usize,
        confirmed_at: DateTime<Utc>,
    },
    HandlerFailed {
        agent_id: AgentId,
        event_type: String,
        event_id: EventId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    CorrelationTimedOut {
        agent_id: AgentId,
        correlation_id: CorrelationId,
        timed_out_at: DateTime<Utc>,
    },
}

impl RuntimeEvent {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            RuntimeEvent::AgentActivated { agent_id, .. }
            | RuntimeEvent::ActivationFailed { agent_id, .. }
            | RuntimeEvent::AgentDeactivated { agent_id, .. }
            | RuntimeEvent::StateConfirmed { agent_id, .. }
            | RuntimeEvent::HandlerFailed { agent_id, .. }
            | RuntimeEvent::CorrelationTimedOut { agent_id, .. } => agent_id,
        }
    }
}
