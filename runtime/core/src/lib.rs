// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `canopy-core`: Event-Sourced Agent Runtime
//!
//! Virtual agents with durable, replayable state and a persisted parent/child
//! topology used for layered broadcast.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | Identities, envelopes, log events, topology, ports, errors, config |
//! | [`application`] | Application | Event log engine, relationship manager, router, correlator, dispatch, lifecycle |
//! | [`infrastructure`] | Infrastructure | Activation runtime, in-memory log/snapshot stores, stream transport, event bus, telemetry |
//!
//! ## Turn Model
//!
//! Every live agent owns one mailbox task. Envelopes delivered by the
//! [`Transport`](domain::transport::Transport) are dispatched to handlers one at
//! a time. A handler stages log events, confirms them in a single durable
//! append, and only then publishes outward through the layered router.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::agent::Agent;
pub use application::context::{AgentContext, ReadOnlyContext};
pub use application::correlator::{PendingResponse, ResponseOutcome, ResponseRoute};
pub use application::dispatch::HandlerTable;
pub use domain::error::AgentError;
pub use domain::events::{BusinessEvent, EventEnvelope, Route};
pub use domain::identity::{AgentId, CorrelationId, EventId};
pub use domain::state::{StateBase, StateLogEvent, Topology};
pub use application::lifecycle::ActivationSettings;
pub use domain::agent::{AgentStatus, DeactivationReason};
pub use infrastructure::runtime::{ActivationRuntime, AgentRef, RuntimeBuilder};
