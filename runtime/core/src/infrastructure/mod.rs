// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod repositories;
pub mod runtime;
pub mod stream_transport;
pub mod telemetry;

pub use event_bus::{EventBusError, RuntimeEventBus};
pub use repositories::{InMemoryEventLogStore, InMemorySnapshotStore};
pub use runtime::{ActivationRuntime, AgentRef, RuntimeBuilder};
pub use stream_transport::InMemoryStreamTransport;
