// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handler Table & Redelivery Window
//!
//! Each agent type fills a [`HandlerTable`] once, keyed by
//! [`BusinessEvent::EVENT_TYPE`]. Dispatch is a map lookup; an envelope with no
//! matching handler is dropped without error.
//!
//! | Registration | Runs as | Sees |
//! |--------------|---------|------|
//! | [`HandlerTable::on`] | mutating turn | `&mut AgentContext`, decoded event |
//! | [`HandlerTable::on_request`] | mutating turn, reply sent automatically | `&mut AgentContext`, decoded request |
//! | [`HandlerTable::on_read_only`] | concurrent task on a committed snapshot | `ReadOnlyContext`, decoded event |
//! | [`HandlerTable::on_any`] | mutating turn for every envelope | `&mut AgentContext`, raw envelope |

use futures::future::BoxFuture;
use lru::LruCache;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

use super::agent::Agent;
use super::context::{AgentContext, ReadOnlyContext};
use crate::domain::error::AgentError;
use crate::domain::events::{BusinessEvent, DedupKey, EventEnvelope};

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), AgentError>>;

pub(crate) type MutatingFn<A> = Arc<
    dyn for<'a> Fn(&'a mut AgentContext<A>, &'a EventEnvelope) -> HandlerFuture<'a> + Send + Sync,
>;

pub(crate) type ReadOnlyFn<A> =
    Arc<dyn Fn(ReadOnlyContext<A>, EventEnvelope) -> HandlerFuture<'static> + Send + Sync>;

fn mutating<A, F>(f: F) -> MutatingFn<A>
where
    A: Agent,
    F: for<'a> Fn(&'a mut AgentContext<A>, &'a EventEnvelope) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn read_only<A, F>(f: F) -> ReadOnlyFn<A>
where
    A: Agent,
    F: Fn(ReadOnlyContext<A>, EventEnvelope) -> HandlerFuture<'static> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) enum HandlerKind<A: Agent> {
    Mutating(MutatingFn<A>),
    ReadOnly(ReadOnlyFn<A>),
}

impl<A: Agent> Clone for HandlerKind<A> {
    fn clone(&self) -> Self {
        match self {
            HandlerKind::Mutating(f) => HandlerKind::Mutating(Arc::clone(f)),
            HandlerKind::ReadOnly(f) => HandlerKind::ReadOnly(Arc::clone(f)),
        }
    }
}

/// A registered handler and its options.
pub struct HandlerEntry<A: Agent> {
    pub(crate) kind: HandlerKind<A>,
    allow_self_handling: bool,
}

impl<A: Agent> HandlerEntry<A> {
    fn new(kind: HandlerKind<A>) -> Self {
        Self {
            kind,
            allow_self_handling: false,
        }
    }

    /// Also handle envelopes this agent published itself. Envelopes routed
    /// to self are always handled.
    pub fn allow_self_handling(&mut self) -> &mut Self {
        self.allow_self_handling = true;
        self
    }

    pub fn handles_own_events(&self) -> bool {
        self.allow_self_handling
    }
}

pub struct HandlerTable<A: Agent> {
    typed: HashMap<&'static str, HandlerEntry<A>>,
    catch_all: Vec<HandlerEntry<A>>,
}

impl<A: Agent> Default for HandlerTable<A> {
    fn default() -> Self {
        Self {
            typed: HashMap::new(),
            catch_all: Vec::new(),
        }
    }
}

impl<A: Agent> HandlerTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table populated by `A::register_handlers`.
    pub fn for_agent() -> Self {
        let mut table = Self::new();
        A::register_handlers(&mut table);
        table
    }

    /// Register a mutating handler for `E`.
    pub fn on<E: BusinessEvent>(
        &mut self,
        handler: impl for<'a> Fn(&'a mut AgentContext<A>, E) -> HandlerFuture<'a> + Send + Sync + 'static,
    ) -> &mut HandlerEntry<A> {
        let handler = Arc::new(handler);
        let erased = mutating::<A, _>(move |ctx, envelope| {
            let handler = Arc::clone(&handler);
            let decoded = envelope.decode::<E>();
            Box::pin(async move { handler(ctx, decoded?).await })
        });
        self.insert(E::EVENT_TYPE, HandlerKind::Mutating(erased))
    }

    /// Register a request handler. The returned response is sent to the
    /// requester when the envelope is correlated, and published normally
    /// otherwise.
    pub fn on_request<Req: BusinessEvent, Resp: BusinessEvent>(
        &mut self,
        handler: impl for<'a> Fn(&'a mut AgentContext<A>, Req) -> BoxFuture<'a, Result<Resp, AgentError>>
            + Send
            + Sync
            + 'static,
    ) -> &mut HandlerEntry<A> {
        let handler = Arc::new(handler);
        let erased = mutating::<A, _>(move |ctx, envelope| {
            let handler = Arc::clone(&handler);
            let decoded = envelope.decode::<Req>();
            Box::pin(async move {
                let response = handler(&mut *ctx, decoded?).await?;
                ctx.reply(envelope, &response).await
            })
        });
        self.insert(Req::EVENT_TYPE, HandlerKind::Mutating(erased))
    }

    /// Register a handler that only reads committed state. It may run
    /// concurrently with other read-only handlers of the same agent, never
    /// with a mutating one.
    pub fn on_read_only<E: BusinessEvent>(
        &mut self,
        handler: impl Fn(ReadOnlyContext<A>, E) -> HandlerFuture<'static> + Send + Sync + 'static,
    ) -> &mut HandlerEntry<A> {
        let handler = Arc::new(handler);
        let erased = read_only::<A, _>(move |ctx, envelope| {
            let handler = Arc::clone(&handler);
            let decoded = envelope.decode::<E>();
            Box::pin(async move { handler(ctx, decoded?).await })
        });
        self.insert(E::EVENT_TYPE, HandlerKind::ReadOnly(erased))
    }

    /// Register a mutating handler invoked for every envelope, after the
    /// typed handler (if any).
    pub fn on_any(
        &mut self,
        handler: impl for<'a> Fn(&'a mut AgentContext<A>, &'a EventEnvelope) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    ) -> &mut HandlerEntry<A> {
        self.catch_all
            .push(HandlerEntry::new(HandlerKind::Mutating(Arc::new(handler))));
        let last = self.catch_all.len() - 1;
        &mut self.catch_all[last]
    }

    fn insert(&mut self, event_type: &'static str, kind: HandlerKind<A>) -> &mut HandlerEntry<A> {
        match self.typed.entry(event_type) {
            Entry::Occupied(mut slot) => {
                warn!(
                    agent_type = A::TYPE_NAME,
                    event_type, "Replacing previously registered handler"
                );
                slot.insert(HandlerEntry::new(kind));
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(HandlerEntry::new(kind)),
        }
    }

    pub(crate) fn lookup(&self, event_type: &str) -> Option<&HandlerEntry<A>> {
        self.typed.get(event_type)
    }

    pub(crate) fn catch_all(&self) -> &[HandlerEntry<A>] {
        &self.catch_all
    }

    /// Event types with a typed handler, sorted.
    pub fn subscribed_events(&self) -> Vec<&'static str> {
        let mut events: Vec<&'static str> = self.typed.keys().copied().collect();
        events.sort_unstable();
        events
    }

    pub fn handles_everything(&self) -> bool {
        !self.catch_all.is_empty()
    }
}

/// Recently handled `(correlation, event)` pairs of one activation.
pub struct DedupWindow {
    seen: LruCache<DedupKey, ()>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn contains(&mut self, key: &DedupKey) -> bool {
        self.seen.get(key).is_some()
    }

    pub fn record(&mut self, key: DedupKey) {
        self.seen.put(key, ());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
