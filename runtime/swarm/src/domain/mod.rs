// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure value types describing an agent tree. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`swarm`] | `Swarm`, `SwarmId`, `IntegrityReport`, `ReconcileOutcome` |

pub mod swarm;

pub use swarm::*;
