// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use canopy_core::domain::repository::{EventLogStore, LogEntry, LogStoreError};
use canopy_core::domain::transport::{
    EnvelopeHandler, SubscriptionHandle, Transport, TransportError, UndeliveredHandler,
};
use canopy_core::infrastructure::{InMemoryEventLogStore, InMemoryStreamTransport};
use canopy_core::{Agent, AgentContext, AgentError, AgentId, BusinessEvent, EventEnvelope, HandlerTable};

// ---- transport & store doubles ----

/// In-memory transport that records every publish call.
#[derive(Default)]
pub struct RecordingTransport {
    inner: InMemoryStreamTransport,
    published: Mutex<Vec<(AgentId, EventEnvelope)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(AgentId, EventEnvelope)> {
        self.published.lock().clone()
    }

    pub fn published_of<E: BusinessEvent>(&self) -> Vec<(AgentId, EventEnvelope)> {
        self.published()
            .into_iter()
            .filter(|(_, envelope)| envelope.is::<E>())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn subscribe(
        &self,
        agent_id: &AgentId,
        handler: EnvelopeHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        self.inner.subscribe(agent_id, handler).await
    }

    async fn publish(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), TransportError> {
        self.published.lock().push((target.clone(), envelope.clone()));
        self.inner.publish(target, envelope).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        self.inner.unsubscribe(handle).await
    }

    fn set_undelivered_handler(&self, handler: Weak<dyn UndeliveredHandler>) {
        self.inner.set_undelivered_handler(handler);
    }
}

/// Log store whose appends can be switched off.
#[derive(Default)]
pub struct FlakyLogStore {
    pub inner: InMemoryEventLogStore,
    failing: AtomicBool,
}

impl FlakyLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLogStore for FlakyLogStore {
    async fn append(
        &self,
        agent_id: &AgentId,
        expected_version: u64,
        entries: Vec<LogEntry>,
    ) -> Result<u64, LogStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogStoreError::Unavailable("disk on fire".to_string()));
        }
        self.inner.append(agent_id, expected_version, entries).await
    }

    async fn read(&self, agent_id: &AgentId, after_version: u64) -> Result<Vec<LogEntry>, LogStoreError> {
        self.inner.read(agent_id, after_version).await
    }
}

// ---- business events ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub text: String,
}

impl BusinessEvent for Announce {
    const EVENT_TYPE: &'static str = "test.announce";
}

/// Asks a node to announce `text` to its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub text: String,
}

impl BusinessEvent for Broadcast {
    const EVENT_TYPE: &'static str = "test.broadcast";
}

/// Asks a node to announce `text` to itself in a later turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defer {
    pub text: String,
}

impl BusinessEvent for Defer {
    const EVENT_TYPE: &'static str = "test.defer";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub amount: i64,
}

impl BusinessEvent for Deposit {
    const EVENT_TYPE: &'static str = "test.deposit";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ask {
    pub question: String,
}

impl BusinessEvent for Ask {
    const EVENT_TYPE: &'static str = "test.ask";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub echo: String,
    pub by: String,
}

impl BusinessEvent for Answer {
    const EVENT_TYPE: &'static str = "test.answer";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explode;

impl BusinessEvent for Explode {
    const EVENT_TYPE: &'static str = "test.explode";
}

/// Read-only probe: the node reports how many announcements it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peek {
    pub reply_to: AgentId,
}

impl BusinessEvent for Peek {
    const EVENT_TYPE: &'static str = "test.peek";
}

/// Deposits `amount`, then fails after the deposit is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settle {
    pub amount: i64,
}

impl BusinessEvent for Settle {
    const EVENT_TYPE: &'static str = "test.settle";
}

/// Read-only: reports the balance to `reply_to`, failing while it is zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub reply_to: AgentId,
}

impl BusinessEvent for Audit {
    const EVENT_TYPE: &'static str = "test.audit";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
}

impl BusinessEvent for Note {
    const EVENT_TYPE: &'static str = "test.note";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unknown;

impl BusinessEvent for Unknown {
    const EVENT_TYPE: &'static str = "test.unknown";
}

// ---- agents ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub received: Vec<String>,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    Received { text: String },
    Deposited { amount: i64 },
}

/// General-purpose hierarchical test agent.
#[derive(Default)]
pub struct Node;

impl Agent for Node {
    const TYPE_NAME: &'static str = "node";
    type State = NodeState;
    type LogEvent = NodeEvent;

    fn transition(state: &mut NodeState, event: &NodeEvent) {
        match event {
            NodeEvent::Received { text } => state.received.push(text.clone()),
            NodeEvent::Deposited { amount } => state.balance += amount,
        }
    }

    fn register_handlers(handlers: &mut HandlerTable<Self>) {
        handlers.on::<Announce>(|ctx, announce| {
            Box::pin(async move {
                ctx.stage(NodeEvent::Received { text: announce.text });
                ctx.confirm().await?;
                Ok(())
            })
        });
        handlers.on::<Broadcast>(|ctx, broadcast| {
            Box::pin(async move {
                ctx.publish_downward(&Announce { text: broadcast.text }).await?;
                Ok(())
            })
        });
        handlers.on::<Defer>(|ctx, defer| {
            Box::pin(async move {
                ctx.publish_to_self(&Announce { text: defer.text }).await?;
                Ok(())
            })
        });
        handlers.on::<Deposit>(|ctx, deposit| {
            Box::pin(async move {
                ctx.stage(NodeEvent::Deposited { amount: deposit.amount });
                ctx.confirm().await?;
                Ok(())
            })
        });
        handlers.on_request::<Ask, Answer>(|ctx, ask| {
            Box::pin(async move {
                Ok::<_, AgentError>(Answer {
                    echo: ask.question,
                    by: ctx.id().to_string(),
                })
            })
        });
        handlers.on::<Settle>(|ctx, settle| {
            Box::pin(async move {
                ctx.stage(NodeEvent::Deposited { amount: settle.amount });
                ctx.confirm().await?;
                Err::<(), _>(AgentError::Other(anyhow::anyhow!("downstream publish failed")))
            })
        });
        handlers.on_read_only::<Audit>(|ctx, audit| {
            Box::pin(async move {
                let balance = ctx.state().balance;
                if balance == 0 {
                    return Err(AgentError::Other(anyhow::anyhow!("nothing to audit")));
                }
                let report = Announce {
                    text: format!("audit:{balance}"),
                };
                ctx.send_to(&audit.reply_to, &report).await?;
                Ok(())
            })
        });
        handlers.on::<Explode>(|_, _| {
            Box::pin(async { Err::<(), _>(AgentError::Other(anyhow::anyhow!("exploded"))) })
        });
        handlers.on_read_only::<Peek>(|ctx, peek| {
            Box::pin(async move {
                let report = Announce {
                    text: format!("peek:{}", ctx.state().received.len()),
                };
                ctx.send_to(&peek.reply_to, &report).await?;
                Ok(())
            })
        });
    }
}

/// Agent whose first activation attempt fails.
pub struct Fragile {
    pub attempts: Arc<AtomicUsize>,
}

impl Agent for Fragile {
    const TYPE_NAME: &'static str = "fragile";
    type State = i64;
    type LogEvent = i64;

    fn transition(state: &mut i64, event: &i64) {
        *state += event;
    }

    fn register_handlers(handlers: &mut HandlerTable<Self>) {
        handlers.on::<Deposit>(|ctx, deposit| {
            Box::pin(async move {
                ctx.stage(deposit.amount);
                ctx.confirm().await?;
                Ok(())
            })
        });
    }

    fn on_activate(ctx: &mut AgentContext<Self>) -> BoxFuture<'_, Result<(), AgentError>> {
        let attempt = ctx.agent().attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if attempt == 0 {
                Err(AgentError::Other(anyhow::anyhow!("cold start")))
            } else {
                Ok(())
            }
        })
    }
}

/// Append-only list of notes that lingers while deactivating.
#[derive(Default)]
pub struct Journal;

impl Journal {
    pub const LINGER: Duration = Duration::from_millis(200);
}

impl Agent for Journal {
    const TYPE_NAME: &'static str = "journal";
    type State = Vec<String>;
    type LogEvent = String;

    fn transition(state: &mut Vec<String>, event: &String) {
        state.push(event.clone());
    }

    fn register_handlers(handlers: &mut HandlerTable<Self>) {
        handlers.on::<Note>(|ctx, note| {
            Box::pin(async move {
                ctx.stage(note.text);
                ctx.confirm().await?;
                Ok(())
            })
        });
    }

    fn on_deactivate(_ctx: &mut AgentContext<Self>) -> BoxFuture<'_, Result<(), AgentError>> {
        Box::pin(async {
            tokio::time::sleep(Journal::LINGER).await;
            Ok(())
        })
    }
}

// ---- helpers ----

pub fn node(key: &str) -> AgentId {
    AgentId::new(Node::TYPE_NAME, key)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition never held: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
