// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer
//!
//! Pure types and port traits. Nothing in this layer spawns tasks or touches
//! I/O directly.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod relationship;
pub mod repository;
pub mod state;
pub mod transport;
