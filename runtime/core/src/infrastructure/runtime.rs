// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Activation Runtime
//
// Owns the agent-type registry and the map of live activations. Agents are
// virtual: an AgentRef is only an identity, and the first envelope or call
// addressed to it activates it on demand. The runtime is the transport's
// UndeliveredHandler, so publishing to an inactive identity activates it and
// queues the envelope in the fresh mailbox.
//
// Counterpart writes of parent/child registration run as turns on the
// counterpart (LayerCommand), keeping every log single-writer.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_bus::RuntimeEventBus;
use super::repositories::{InMemoryEventLogStore, InMemorySnapshotStore};
use super::stream_transport::InMemoryStreamTransport;
use crate::application::agent::Agent;
use crate::application::context::AgentContext;
use crate::application::correlator::{Correlator, ResponseOutcome};
use crate::application::dispatch::HandlerTable;
use crate::application::lifecycle::{
    job, layer_job, spawn_activation, ActivationExit, ActivationHandle, ActivationSettings,
    ActivationSpec, LayerCommand, MailboxItem,
};
use crate::application::relationship::RelationshipManager;
use crate::domain::agent::{AgentStatus, DeactivationReason};
use crate::domain::config::RuntimeConfigManifest;
use crate::domain::error::AgentError;
use crate::domain::events::{BusinessEvent, Correlation, EventEnvelope, Route};
use crate::domain::identity::{AgentId, CorrelationId};
use crate::domain::relationship::{AgentDirectory, RelationshipDiscrepancy};
use crate::domain::repository::{EventLogStore, SnapshotStore};
use crate::domain::state::{StateBase, Topology};
use crate::domain::transport::{EnvelopeHandler, Transport, TransportError, UndeliveredHandler};

/// Type segment of identities used by callers outside any agent.
pub const CLIENT_TYPE: &str = "client";

/// An activation can flip to `Deactivating` between lookup and enqueue; the
/// retry lands on its successor.
const ENQUEUE_ATTEMPTS: usize = 3;

/// Builder for [`ActivationRuntime`]. Unset ports default to the in-memory
/// implementations.
#[derive(Default)]
pub struct RuntimeBuilder {
    transport: Option<Arc<dyn Transport>>,
    log_store: Option<Arc<dyn EventLogStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    bus: Option<RuntimeEventBus>,
    settings: ActivationSettings,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_log_store(mut self, store: Arc<dyn EventLogStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: RuntimeEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_config(mut self, config: &RuntimeConfigManifest) -> Self {
        self.settings = ActivationSettings::from(&config.spec);
        self
    }

    pub fn with_settings(mut self, settings: ActivationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> ActivationRuntime {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryStreamTransport::new()));
        let log_store = self
            .log_store
            .unwrap_or_else(|| Arc::new(InMemoryEventLogStore::new()));
        let snapshots = match (self.snapshots, self.settings.snapshot_interval) {
            (Some(store), _) => Some(store),
            (None, Some(_)) => Some(Arc::new(InMemorySnapshotStore::new()) as Arc<dyn SnapshotStore>),
            (None, None) => None,
        };

        let inner = Arc::new_cyclic(|me| RuntimeInner {
            me: me.clone(),
            client_id: AgentId::new(CLIENT_TYPE, Uuid::new_v4().to_string()),
            transport,
            log_store,
            snapshots,
            bus: self.bus.unwrap_or_default(),
            settings: self.settings,
            factories: DashMap::new(),
            activations: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        });
        let fallback: Arc<dyn UndeliveredHandler> = inner.clone();
        inner.transport.set_undelivered_handler(Arc::downgrade(&fallback));

        ActivationRuntime { inner }
    }
}

/// Type-erased view of an [`ActivationHandle`].
trait ErasedActivation: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn instance_id(&self) -> Uuid;
    fn status(&self) -> AgentStatus;
    fn topology(&self) -> Topology;
    /// Hands the envelope back when the activation no longer accepts work.
    fn deliver(&self, envelope: EventEnvelope) -> Result<(), Option<EventEnvelope>>;
    /// `None` when the activation no longer accepts work.
    fn enqueue_layer(&self, command: LayerCommand) -> Option<oneshot::Receiver<Result<(), AgentError>>>;
    fn request_deactivation(&self, reason: DeactivationReason) -> bool;
    fn wait_ready(&self) -> BoxFuture<'static, Result<(), AgentError>>;
    fn wait_deactivated(&self) -> BoxFuture<'static, ()>;
    fn closed_error(&self) -> AgentError;
}

impl<A: Agent> ErasedActivation for ActivationHandle<A> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn instance_id(&self) -> Uuid {
        ActivationHandle::instance_id(self)
    }

    fn status(&self) -> AgentStatus {
        ActivationHandle::status(self)
    }

    fn topology(&self) -> Topology {
        ActivationHandle::topology(self)
    }

    fn deliver(&self, envelope: EventEnvelope) -> Result<(), Option<EventEnvelope>> {
        self.enqueue(MailboxItem::Deliver(envelope))
            .map_err(MailboxItem::into_envelope)
    }

    fn enqueue_layer(&self, command: LayerCommand) -> Option<oneshot::Receiver<Result<(), AgentError>>> {
        let (reply, receiver) = oneshot::channel();
        self.enqueue(MailboxItem::Invoke(layer_job::<A>(command, reply)))
            .ok()
            .map(|()| receiver)
    }

    fn request_deactivation(&self, reason: DeactivationReason) -> bool {
        ActivationHandle::request_deactivation(self, reason)
    }

    fn wait_ready(&self) -> BoxFuture<'static, Result<(), AgentError>> {
        let handle = self.clone();
        async move { handle.wait_ready().await }.boxed()
    }

    fn wait_deactivated(&self) -> BoxFuture<'static, ()> {
        let handle = self.clone();
        async move { handle.wait_deactivated().await }.boxed()
    }

    fn closed_error(&self) -> AgentError {
        ActivationHandle::closed_error(self)
    }
}

trait AgentFactory: Send + Sync {
    fn spawn(
        &self,
        runtime: &Arc<RuntimeInner>,
        agent_id: AgentId,
        predecessor: Option<Arc<dyn ErasedActivation>>,
    ) -> Arc<dyn ErasedActivation>;
}

struct TypedFactory<A, F> {
    make: F,
    _agent: PhantomData<fn() -> A>,
}

impl<A, F> AgentFactory for TypedFactory<A, F>
where
    A: Agent,
    F: Fn(&AgentId) -> A + Send + Sync + 'static,
{
    fn spawn(
        &self,
        runtime: &Arc<RuntimeInner>,
        agent_id: AgentId,
        predecessor: Option<Arc<dyn ErasedActivation>>,
    ) -> Arc<dyn ErasedActivation> {
        let owner = Arc::downgrade(runtime);
        let predecessor = predecessor.and_then(|previous| {
            previous
                .as_any()
                .downcast_ref::<ActivationHandle<A>>()
                .map(ActivationHandle::take_handoff)
        });
        let handle = spawn_activation(ActivationSpec {
            agent: (self.make)(&agent_id),
            agent_id,
            transport: Arc::clone(&runtime.transport),
            log_store: Arc::clone(&runtime.log_store),
            snapshots: runtime.snapshots.clone(),
            directory: Arc::new(RuntimeDirectory {
                runtime: Arc::downgrade(runtime),
            }),
            bus: runtime.bus.clone(),
            settings: runtime.settings.clone(),
            predecessor,
            on_exit: Box::new(move |exit: ActivationExit<A>| {
                if let Some(runtime) = owner.upgrade() {
                    runtime.on_exit(exit);
                }
            }),
        });
        Arc::new(handle)
    }
}

struct RuntimeInner {
    me: Weak<RuntimeInner>,
    client_id: AgentId,
    transport: Arc<dyn Transport>,
    log_store: Arc<dyn EventLogStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    bus: RuntimeEventBus,
    settings: ActivationSettings,
    factories: DashMap<String, Arc<dyn AgentFactory>>,
    activations: DashMap<AgentId, Arc<dyn ErasedActivation>>,
    shutting_down: AtomicBool,
}

impl RuntimeInner {
    fn ensure_registered(&self, agent_id: &AgentId) -> Result<Arc<dyn AgentFactory>, AgentError> {
        self.factories
            .get(agent_id.type_name())
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| AgentError::UnknownAgentType(agent_id.type_name().to_string()))
    }

    /// Live activation for `agent_id`, starting one if none accepts work.
    fn activation_for(&self, agent_id: &AgentId) -> Result<Arc<dyn ErasedActivation>, AgentError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AgentError::Deactivated(agent_id.clone()));
        }
        let factory = self.ensure_registered(agent_id)?;
        let runtime = self
            .me
            .upgrade()
            .ok_or_else(|| AgentError::Deactivated(agent_id.clone()))?;

        let activation = match self.activations.entry(agent_id.clone()) {
            Entry::Occupied(mut slot) if !slot.get().status().accepts_work() => {
                let predecessor = Arc::clone(slot.get());
                let fresh = factory.spawn(&runtime, agent_id.clone(), Some(predecessor));
                slot.insert(Arc::clone(&fresh));
                fresh
            }
            Entry::Occupied(slot) => Arc::clone(slot.get()),
            Entry::Vacant(slot) => {
                let fresh = factory.spawn(&runtime, agent_id.clone(), None);
                slot.insert(Arc::clone(&fresh));
                fresh
            }
        };
        Ok(activation)
    }

    fn current(&self, agent_id: &AgentId) -> Option<Arc<dyn ErasedActivation>> {
        self.activations
            .get(agent_id)
            .map(|activation| Arc::clone(activation.value()))
    }

    fn deliver(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), AgentError> {
        let mut envelope = envelope;
        for _ in 0..ENQUEUE_ATTEMPTS {
            match self.activation_for(target)?.deliver(envelope) {
                Ok(()) => return Ok(()),
                Err(Some(rejected)) => envelope = rejected,
                Err(None) => break,
            }
        }
        Err(AgentError::Deactivated(target.clone()))
    }

    fn enqueue_typed<A: Agent>(&self, agent_id: &AgentId, item: MailboxItem<A>) -> Result<(), AgentError> {
        let mut item = item;
        for _ in 0..ENQUEUE_ATTEMPTS {
            let activation = self.activation_for(agent_id)?;
            let handle = activation
                .as_any()
                .downcast_ref::<ActivationHandle<A>>()
                .ok_or_else(|| AgentError::UnknownAgentType(agent_id.type_name().to_string()))?;
            match handle.enqueue(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }
        }
        Err(AgentError::Deactivated(agent_id.clone()))
    }

    async fn run_layer(&self, agent_id: &AgentId, command: LayerCommand) -> Result<(), AgentError> {
        for _ in 0..ENQUEUE_ATTEMPTS {
            let activation = self.activation_for(agent_id)?;
            let Some(reply) = activation.enqueue_layer(command.clone()) else {
                continue;
            };
            return match reply.await {
                Ok(result) => result,
                Err(_) => Err(activation.closed_error()),
            };
        }
        Err(AgentError::Deactivated(agent_id.clone()))
    }

    async fn topology_of(&self, agent_id: &AgentId) -> Result<Topology, AgentError> {
        let activation = self.activation_for(agent_id)?;
        activation.wait_ready().await?;
        Ok(activation.topology())
    }

    fn directory(&self) -> Arc<dyn AgentDirectory> {
        Arc::new(RuntimeDirectory {
            runtime: self.me.clone(),
        })
    }

    /// Pass the items a finished activation left queued to its successor,
    /// starting one if nothing replaced it yet. Runs under the entry lock so
    /// no later delivery can overtake the requeued items.
    fn on_exit<A: Agent>(&self, exit: ActivationExit<A>) {
        let ActivationExit {
            agent_id,
            instance_id,
            reason,
            leftovers,
            handoff,
        } = exit;

        let dropping = reason == DeactivationReason::Shutdown || self.shutting_down.load(Ordering::Acquire);
        let leftovers = if dropping && !leftovers.is_empty() {
            metrics::counter!("canopy_envelopes_dropped_total", "reason" => "shutdown")
                .increment(leftovers.len() as u64);
            debug!(agent_id = %agent_id, dropped = leftovers.len(), "Dropped queued items at shutdown");
            Vec::new()
        } else {
            leftovers
        };
        let requeued = leftovers.len();
        // a successor spawned during deactivation is waiting on this
        let _ = handoff.send(leftovers);

        let Entry::Occupied(mut slot) = self.activations.entry(agent_id.clone()) else {
            return;
        };
        if slot.get().instance_id() != instance_id {
            if requeued > 0 {
                debug!(agent_id = %agent_id, requeued, "Queued items handed to the new activation");
            }
            return;
        }
        if requeued == 0 {
            slot.remove();
            return;
        }

        let successor = self.ensure_registered(&agent_id).and_then(|factory| {
            let runtime = self
                .me
                .upgrade()
                .ok_or_else(|| AgentError::Deactivated(agent_id.clone()))?;
            Ok(factory.spawn(&runtime, agent_id.clone(), Some(Arc::clone(slot.get()))))
        });
        match successor {
            Ok(fresh) => {
                debug!(agent_id = %agent_id, requeued, "Queued items handed to a new activation");
                slot.insert(fresh);
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, dropped = requeued, "Failed to reactivate for queued items");
                slot.remove();
            }
        }
    }
}

#[async_trait]
impl UndeliveredHandler for RuntimeInner {
    async fn undelivered(&self, target: &AgentId, envelope: EventEnvelope) -> Result<(), TransportError> {
        if envelope.is_reply() {
            // the requester is gone, and so is its pending correlation
            metrics::counter!("canopy_correlation_replies_dropped_total").increment(1);
            debug!(target = %target, "Reply for inactive agent dropped");
            return Ok(());
        }
        match self.deliver(target, envelope) {
            Ok(()) => Ok(()),
            Err(AgentError::UnknownAgentType(type_name)) => {
                metrics::counter!("canopy_envelopes_dropped_total", "reason" => "unknown_type")
                    .increment(1);
                debug!(target = %target, type_name = %type_name, "No agent type registered, envelope dropped");
                Ok(())
            }
            Err(e) => Err(TransportError::Delivery {
                target: target.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// [`AgentDirectory`] backed by the runtime: reads wait for the counterpart's
/// activation, writes run as a turn on the counterpart.
struct RuntimeDirectory {
    runtime: Weak<RuntimeInner>,
}

impl RuntimeDirectory {
    fn runtime(&self, agent_id: &AgentId) -> Result<Arc<RuntimeInner>, AgentError> {
        self.runtime
            .upgrade()
            .ok_or_else(|| AgentError::Deactivated(agent_id.clone()))
    }
}

#[async_trait]
impl AgentDirectory for RuntimeDirectory {
    async fn topology_of(&self, agent_id: &AgentId) -> Result<Topology, AgentError> {
        self.runtime(agent_id)?.topology_of(agent_id).await
    }

    async fn set_parent(&self, child: &AgentId, parent: &AgentId) -> Result<(), AgentError> {
        self.runtime(child)?
            .run_layer(child, LayerCommand::SetParent(parent.clone()))
            .await
    }

    async fn clear_parent(&self, child: &AgentId, parent: &AgentId) -> Result<(), AgentError> {
        self.runtime(child)?
            .run_layer(child, LayerCommand::ClearParent(parent.clone()))
            .await
    }
}

/// Registry of agent types and live activations.
#[derive(Clone)]
pub struct ActivationRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for ActivationRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationRuntime {
    /// Runtime over in-memory transport and stores with default settings.
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Register `A`, building each activation's agent value with `factory`.
    ///
    /// `factory` runs while the activation map entry is locked and must not
    /// call back into the runtime.
    pub fn register_agent_type<A, F>(&self, factory: F)
    where
        A: Agent,
        F: Fn(&AgentId) -> A + Send + Sync + 'static,
    {
        let previous = self.inner.factories.insert(
            A::TYPE_NAME.to_string(),
            Arc::new(TypedFactory {
                make: factory,
                _agent: PhantomData::<fn() -> A>,
            }),
        );
        if previous.is_some() {
            warn!(agent_type = A::TYPE_NAME, "Agent type re-registered");
        } else {
            info!(agent_type = A::TYPE_NAME, "Agent type registered");
        }
    }

    /// [`register_agent_type`](Self::register_agent_type) with `A::default()`.
    pub fn register<A: Agent + Default>(&self) {
        self.register_agent_type::<A, _>(|_| A::default());
    }

    /// Reference to the agent of type `A` with `key`. Does not activate it.
    pub fn get<A: Agent>(&self, key: impl Into<String>) -> AgentRef<A> {
        AgentRef {
            id: AgentId::new(A::TYPE_NAME, key),
            runtime: self.clone(),
            _agent: PhantomData,
        }
    }

    pub fn get_by_id<A: Agent>(&self, id: AgentId) -> Result<AgentRef<A>, AgentError> {
        if id.type_name() != A::TYPE_NAME {
            return Err(AgentError::UnknownAgentType(id.type_name().to_string()));
        }
        Ok(AgentRef {
            id,
            runtime: self.clone(),
            _agent: PhantomData,
        })
    }

    pub fn event_bus(&self) -> &RuntimeEventBus {
        &self.inner.bus
    }

    pub fn settings(&self) -> &ActivationSettings {
        &self.inner.settings
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Identity used as publisher for envelopes sent from outside any agent.
    pub fn client_id(&self) -> &AgentId {
        &self.inner.client_id
    }

    /// Point-to-point publish from outside any agent.
    pub async fn send<E: BusinessEvent>(&self, target: &AgentId, event: &E) -> Result<(), AgentError> {
        self.inner.ensure_registered(target)?;
        let envelope = EventEnvelope::new(event, self.inner.client_id.clone(), Route::PointToPoint)?;
        self.inner.transport.publish(target, envelope).await?;
        Ok(())
    }

    /// Correlated request from outside any agent. Waits up to `timeout`
    /// (the configured default when `None`) for the reply.
    pub async fn request<E: BusinessEvent>(
        &self,
        target: &AgentId,
        event: &E,
        timeout: Option<Duration>,
    ) -> Result<ResponseOutcome, AgentError> {
        self.inner.ensure_registered(target)?;
        let requester = AgentId::new(CLIENT_TYPE, Uuid::new_v4().to_string());
        let request = EventEnvelope::new(event, requester.clone(), Route::PointToPoint)?;
        let correlator = Arc::new(Correlator::new(requester.clone()));
        let resolver = Arc::clone(&correlator);
        let on_reply: EnvelopeHandler = Arc::new(move |envelope: EventEnvelope| {
            resolver.resolve(envelope);
            futures::future::ok::<(), TransportError>(()).boxed()
        });
        let subscription = self.inner.transport.subscribe(&requester, on_reply).await?;

        let timeout = timeout.unwrap_or(self.inner.settings.default_timeout);
        let sweeper = CancellationToken::new();
        Arc::clone(&correlator).spawn_sweeper(
            self.inner.settings.sweep_interval,
            sweeper.clone(),
            move |correlation_id| debug!(correlation_id = %correlation_id, "Client request timed out"),
        );
        let _sweeping = sweeper.drop_guard();
        let pending = correlator.register(timeout);
        let correlation_id: CorrelationId = pending.correlation_id();
        let envelope = request.with_correlation(Correlation::Request {
            id: correlation_id,
            reply_to: requester,
        });

        let outcome = match self.inner.transport.publish(target, envelope).await {
            Ok(()) => Ok(pending.wait().await),
            Err(e) => {
                correlator.abandon(correlation_id);
                Err(e.into())
            }
        };
        if let Err(e) = self.inner.transport.unsubscribe(&subscription).await {
            debug!(error = %e, "Failed to drop request subscription");
        }
        outcome
    }

    /// Activate `agent_id` and wait until it is `Active`.
    pub async fn activate(&self, agent_id: &AgentId) -> Result<(), AgentError> {
        let activation = self.inner.activation_for(agent_id)?;
        activation.wait_ready().await
    }

    /// Deactivate `agent_id` after the work already queued. Returns `false`
    /// when it was not active.
    pub async fn deactivate(&self, agent_id: &AgentId) -> bool {
        let Some(activation) = self.inner.current(agent_id) else {
            return false;
        };
        if !activation.status().accepts_work() || !activation.request_deactivation(DeactivationReason::Requested) {
            activation.wait_deactivated().await;
            return false;
        }
        activation.wait_deactivated().await;
        true
    }

    /// `Uninitialized` when no activation is live.
    pub fn status(&self, agent_id: &AgentId) -> AgentStatus {
        self.inner
            .current(agent_id)
            .map(|activation| activation.status())
            .unwrap_or(AgentStatus::Uninitialized)
    }

    pub fn active_agents(&self) -> Vec<AgentId> {
        let mut active: Vec<AgentId> = self
            .inner
            .activations
            .iter()
            .filter(|entry| entry.value().status() == AgentStatus::Active)
            .map(|entry| entry.key().clone())
            .collect();
        active.sort();
        active
    }

    /// Committed topology of `agent_id`, activating it if needed.
    pub async fn topology_of(&self, agent_id: &AgentId) -> Result<Topology, AgentError> {
        self.inner.topology_of(agent_id).await
    }

    /// Register `children` under `parent` as one turn on `parent`.
    pub async fn register_children(&self, parent: &AgentId, children: Vec<AgentId>) -> Result<(), AgentError> {
        self.inner
            .run_layer(parent, LayerCommand::RegisterChildren(children))
            .await
    }

    pub async fn unregister_child(&self, parent: &AgentId, child: &AgentId) -> Result<(), AgentError> {
        self.inner
            .run_layer(parent, LayerCommand::UnregisterChild(child.clone()))
            .await
    }

    /// Link-by-link comparison of `agent_id`'s topology with its counterparts.
    pub async fn validate_relationship(&self, agent_id: &AgentId) -> Result<Vec<RelationshipDiscrepancy>, AgentError> {
        RelationshipManager::new(self.inner.directory(), self.inner.settings.max_depth)
            .validate_agent(agent_id)
            .await
    }

    /// Deactivate every live agent and refuse new activations.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let live: Vec<Arc<dyn ErasedActivation>> = self
            .inner
            .activations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(agents = live.len(), "Shutting down activation runtime");

        for activation in &live {
            activation.request_deactivation(DeactivationReason::Shutdown);
        }
        futures::future::join_all(live.iter().map(|activation| activation.wait_deactivated())).await;
    }
}

/// Typed reference to a virtual agent. Cheap to clone; holds no activation.
pub struct AgentRef<A: Agent> {
    id: AgentId,
    runtime: ActivationRuntime,
    _agent: PhantomData<fn() -> A>,
}

impl<A: Agent> Clone for AgentRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            runtime: self.runtime.clone(),
            _agent: PhantomData,
        }
    }
}

impl<A: Agent> std::fmt::Debug for AgentRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRef").field("id", &self.id).finish()
    }
}

impl<A: Agent> AgentRef<A> {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Run `f` as a mutating turn on the agent and return its result.
    pub async fn invoke<R, F>(&self, f: F) -> Result<R, AgentError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut AgentContext<A>) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let turn = job::<A, _>(move |ctx| {
            let work = f(ctx);
            Box::pin(async move {
                let _ = tx.send(work.await);
            })
        });
        self.runtime
            .inner
            .enqueue_typed::<A>(&self.id, MailboxItem::Invoke(turn))?;
        match rx.await {
            Ok(result) => Ok(result),
            Err(_) => Err(self
                .runtime
                .inner
                .current(&self.id)
                .map(|activation| activation.closed_error())
                .unwrap_or_else(|| AgentError::Deactivated(self.id.clone()))),
        }
    }

    /// Committed agent state.
    pub async fn state(&self) -> Result<A::State, AgentError> {
        self.invoke(|ctx| Box::pin(futures::future::ready(ctx.state().clone())))
            .await
    }

    /// Committed state and topology.
    pub async fn committed(&self) -> Result<Arc<StateBase<A::State>>, AgentError> {
        self.invoke(|ctx| Box::pin(futures::future::ready(ctx.committed())))
            .await
    }

    pub async fn version(&self) -> Result<u64, AgentError> {
        self.invoke(|ctx| Box::pin(futures::future::ready(ctx.version())))
            .await
    }

    pub async fn topology(&self) -> Result<Topology, AgentError> {
        self.runtime.topology_of(&self.id).await
    }

    pub async fn parent(&self) -> Result<Option<AgentId>, AgentError> {
        Ok(self.topology().await?.parent)
    }

    pub async fn children(&self) -> Result<Vec<AgentId>, AgentError> {
        Ok(self.topology().await?.children.into_iter().collect())
    }

    pub async fn register_child(&self, child: &AgentId) -> Result<(), AgentError> {
        self.runtime.register_children(&self.id, vec![child.clone()]).await
    }

    pub async fn register_children(&self, children: Vec<AgentId>) -> Result<(), AgentError> {
        self.runtime.register_children(&self.id, children).await
    }

    pub async fn unregister_child(&self, child: &AgentId) -> Result<(), AgentError> {
        self.runtime.unregister_child(&self.id, child).await
    }

    pub async fn validate_relationship(&self) -> Result<Vec<RelationshipDiscrepancy>, AgentError> {
        self.runtime.validate_relationship(&self.id).await
    }

    pub async fn send<E: BusinessEvent>(&self, event: &E) -> Result<(), AgentError> {
        self.runtime.send(&self.id, event).await
    }

    pub async fn request<E: BusinessEvent>(
        &self,
        event: &E,
        timeout: Option<Duration>,
    ) -> Result<ResponseOutcome, AgentError> {
        self.runtime.request(&self.id, event, timeout).await
    }

    pub async fn activate(&self) -> Result<(), AgentError> {
        self.runtime.activate(&self.id).await
    }

    pub async fn deactivate(&self) -> bool {
        self.runtime.deactivate(&self.id).await
    }

    pub fn status(&self) -> AgentStatus {
        self.runtime.status(&self.id)
    }

    /// Event types `A` has typed handlers for.
    pub fn subscribed_events(&self) -> Vec<&'static str> {
        HandlerTable::<A>::for_agent().subscribed_events()
    }
}
