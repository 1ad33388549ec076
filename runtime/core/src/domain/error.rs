// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Error Taxonomy
//!
//! [`AgentError`] is the single error type surfaced to handler code. Failures
//! inside a live turn are confined to that turn: the committed state only
//! changes at a successful confirm.

use thiserror::Error;

use super::events::EnvelopeError;
use super::identity::AgentId;
use super::relationship::RelationshipError;
use super::repository::LogStoreError;
use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Confirm could not durably append; staged events were discarded.
    #[error("failed to persist {count} staged event(s) for {agent_id}: {source}")]
    PersistenceFailure {
        agent_id: AgentId,
        count: usize,
        #[source]
        source: LogStoreError,
    },

    /// Gap or out-of-order version found during replay.
    #[error("event log of {agent_id} is corrupt: expected version {expected}, found {found}")]
    LogCorruption {
        agent_id: AgentId,
        expected: u64,
        found: u64,
    },

    #[error("failed to read event log of {agent_id}: {source}")]
    LogRead {
        agent_id: AgentId,
        #[source]
        source: LogStoreError,
    },

    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("{agent_id} has {pending} unconfirmed staged event(s); confirm before publishing")]
    UnconfirmedEvents { agent_id: AgentId, pending: usize },

    #[error("agent {0} is deactivated")]
    Deactivated(AgentId),

    #[error("no factory registered for agent type '{0}'")]
    UnknownAgentType(String),

    #[error("activation of {agent_id} failed: {reason}")]
    ActivationFailed { agent_id: AgentId, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One child that a downward publish could not reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub target: AgentId,
    pub reason: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("publish to {target} failed: {reason}")]
    Delivery { target: AgentId, reason: String },

    #[error("downward publish reached {delivered} of {attempted} children")]
    Fanout {
        attempted: usize,
        delivered: usize,
        failures: Vec<DeliveryFailure>,
    },

    #[error("{target} is not a child of {agent_id}")]
    NotAChild { agent_id: AgentId, target: AgentId },
}
