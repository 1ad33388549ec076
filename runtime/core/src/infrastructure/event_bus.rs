// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runtime Event Bus - Pub/Sub for lifecycle notifications
//
// In-memory fan-out of RuntimeEvent over a tokio broadcast channel. Observers
// (tests, dashboards, audit sinks) subscribe; slow receivers lag and lose the
// oldest events rather than back-pressuring agents.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::domain::events::RuntimeEvent;
use crate::domain::identity::AgentId;

/// Event bus for publishing and subscribing to runtime events
#[derive(Clone)]
pub struct RuntimeEventBus {
    sender: Arc<broadcast::Sender<RuntimeEvent>>,
}

impl RuntimeEventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a runtime event to all subscribers
    pub fn publish(&self, event: RuntimeEvent) {
        trace!(agent_id = %event.agent_id(), "Publishing runtime event");
        // send() only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    /// Subscribe to all runtime events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for one agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RuntimeEventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all runtime events
pub struct EventReceiver {
    receiver: broadcast::Receiver<RuntimeEvent>,
}

impl EventReceiver {
    /// Receive the next event
    pub async fn recv(&mut self) -> Result<RuntimeEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<RuntimeEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single agent
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<RuntimeEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    /// Receive the next event concerning the filtered agent
    pub async fn recv(&mut self) -> Result<RuntimeEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.agent_id() == &self.agent_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
