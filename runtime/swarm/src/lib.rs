// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `canopy-swarm`: Tree-Level Coordination
//!
//! Treats an agent and every descendant reachable through its committed
//! `children` as one unit (a **Swarm**) on top of the `canopy-core` runtime.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `Swarm`, `SwarmId`, `IntegrityReport`, `ReconcileOutcome` |
//! | [`application`] | Application | `SwarmService` use-case trait and `StandardSwarmService` |
//!
//! ## Key Concepts
//!
//! - **Membership** is never stored separately. It is read breadth-first from
//!   the agents' own logs, so it always reflects committed topology.
//! - **Audit** runs relationship validation for every member.
//! - **Reconcile** is the explicit caller-level retry for links that were
//!   only half written. Nothing in the runtime repairs them automatically.
//! - **Dissolve** unregisters links bottom-up, leaves before their parents.

pub mod application;
pub mod domain;

pub use application::{StandardSwarmService, SwarmService};
pub use domain::*;
