// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! The [`Agent`] trait implemented by every agent type.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use super::context::AgentContext;
use super::dispatch::HandlerTable;
use crate::domain::error::AgentError;

/// An event-sourced agent type.
///
/// `State` is rebuilt by folding `LogEvent`s through [`Agent::transition`];
/// handlers never mutate it directly. The agent value itself (`Self`) holds
/// transient, non-persisted data and is owned by the activation.
pub trait Agent: Send + Sync + Sized + 'static {
    /// Type segment of every [`AgentId`](crate::domain::identity::AgentId) of this agent.
    const TYPE_NAME: &'static str;

    type State: Clone + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    type LogEvent: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Pure state transition. Must be deterministic.
    fn transition(state: &mut Self::State, event: &Self::LogEvent);

    /// Populate the handler table. Called once per activation.
    fn register_handlers(handlers: &mut HandlerTable<Self>);

    /// Runs after replay, before the first envelope is dispatched. An error
    /// aborts the activation.
    fn on_activate(ctx: &mut AgentContext<Self>) -> BoxFuture<'_, Result<(), AgentError>> {
        let _ = ctx;
        futures::future::ok(()).boxed()
    }

    /// Runs during deactivation. Errors are logged and otherwise ignored.
    fn on_deactivate(ctx: &mut AgentContext<Self>) -> BoxFuture<'_, Result<(), AgentError>> {
        let _ = ctx;
        futures::future::ok(()).boxed()
    }

    fn description(&self) -> String {
        format!("{} agent", Self::TYPE_NAME)
    }
}
