// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`agent`] | `Agent` trait implemented per agent type |
//! | [`event_log`] | Stage/confirm/replay engine |
//! | [`relationship`] | Parent/child registration and validation |
//! | [`router`] | Upward, downward, self and point-to-point publishing |
//! | [`correlator`] | Pending request/response map with deadline sweep |
//! | [`dispatch`] | Handler table and redelivery dedup window |
//! | [`context`] | Per-turn API exposed to handler code |
//! | [`lifecycle`] | Activation state machine and mailbox loop |

pub mod agent;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod event_log;
pub mod lifecycle;
pub mod relationship;
pub mod router;
