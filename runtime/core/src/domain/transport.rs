// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transport Port
//!
//! At-least-once, FIFO-per-sender/receiver delivery keyed by [`AgentId`].
//! Publishing is fire-and-forget: a successful `publish` means the transport
//! accepted the envelope, not that a handler ran.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::{Arc, Weak};
use thiserror::Error;
use uuid::Uuid;

use super::events::EventEnvelope;
use super::identity::AgentId;

/// Callback invoked for every envelope delivered to a subscription.
pub type EnvelopeHandler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub agent_id: AgentId,
    pub id: Uuid,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The receiving mailbox is closed (agent deactivating).
    #[error("mailbox of {0} is closed")]
    Closed(AgentId),

    #[error("delivery to {target} failed: {reason}")]
    Delivery { target: AgentId, reason: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Receives envelopes addressed to identities with no live subscription.
#[async_trait]
pub trait UndeliveredHandler: Send + Sync {
    async fn undelivered(&self, target: &AgentId, envelope: EventEnvelope)
        -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        agent_id: &AgentId,
        handler: EnvelopeHandler,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn publish(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), TransportError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    /// Install the fallback for envelopes with no subscriber. Transports that
    /// park or drop such envelopes themselves may ignore it.
    fn set_undelivered_handler(&self, _handler: Weak<dyn UndeliveredHandler>) {}
}
