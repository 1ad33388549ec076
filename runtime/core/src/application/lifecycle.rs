// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Activation Lifecycle
//!
//! One activation is one tokio task owning an [`AgentContext`] and draining
//! an unbounded mailbox. Mutating turns run one at a time on that task;
//! read-only handlers are spawned onto a [`JoinSet`] and joined before the
//! next mutating turn.
//!
//! ```text
//! Uninitialized ─▶ Activating ─▶ Active ─▶ Deactivating ─▶ Deactivated
//!                      │                                        ▲
//!                      └──────────── replay/hook failure ───────┘
//! ```
//!
//! Correlated replies bypass the mailbox: the transport callback resolves
//! them directly, so a turn blocked in `publish_with_response` can still be
//! woken by its reply.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::agent::Agent;
use super::context::AgentContext;
use super::correlator::Correlator;
use super::dispatch::{DedupWindow, HandlerKind, HandlerTable, MutatingFn, ReadOnlyFn};
use super::event_log::{EventLogEngine, SharedTopology};
use super::relationship::{RelationshipManager, DEFAULT_MAX_DEPTH};
use super::router::LayeredRouter;
use crate::domain::agent::{AgentStatus, DeactivationReason};
use crate::domain::config::RuntimeConfigSpec;
use crate::domain::error::AgentError;
use crate::domain::events::{Correlation, DedupKey, EventEnvelope, HandlerFailed, Route, RuntimeEvent};
use crate::domain::identity::AgentId;
use crate::domain::relationship::AgentDirectory;
use crate::domain::repository::{EventLogStore, SnapshotStore};
use crate::domain::state::Topology;
use crate::domain::transport::{EnvelopeHandler, SubscriptionHandle, Transport, TransportError};
use crate::infrastructure::event_bus::RuntimeEventBus;

/// Per-activation knobs, derived from [`RuntimeConfigSpec`].
#[derive(Debug, Clone)]
pub struct ActivationSettings {
    pub default_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_depth: usize,
    pub dedup_window: usize,
    pub report_handler_failures: bool,
    pub idle_timeout: Option<Duration>,
    pub snapshot_interval: Option<u64>,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(25),
            max_depth: DEFAULT_MAX_DEPTH,
            dedup_window: 1024,
            report_handler_failures: true,
            idle_timeout: None,
            snapshot_interval: None,
        }
    }
}

impl From<&RuntimeConfigSpec> for ActivationSettings {
    fn from(spec: &RuntimeConfigSpec) -> Self {
        Self {
            default_timeout: spec.correlation.default_timeout,
            sweep_interval: spec.correlation.sweep_interval,
            max_depth: spec.hierarchy.max_depth,
            dedup_window: spec.dispatch.dedup_window,
            report_handler_failures: spec.dispatch.report_handler_failures,
            idle_timeout: spec.activation.idle_timeout,
            snapshot_interval: spec.event_log.snapshot_interval,
        }
    }
}

/// Closure run as a mutating turn on the activation task.
pub(crate) type Job<A> =
    Box<dyn for<'a> FnOnce(&'a mut AgentContext<A>) -> BoxFuture<'a, ()> + Send>;

pub(crate) fn job<A, F>(f: F) -> Job<A>
where
    A: Agent,
    F: for<'a> FnOnce(&'a mut AgentContext<A>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

pub(crate) enum MailboxItem<A: Agent> {
    Deliver(EventEnvelope),
    Invoke(Job<A>),
    Deactivate(DeactivationReason),
}

impl<A: Agent> MailboxItem<A> {
    pub(crate) fn into_envelope(self) -> Option<EventEnvelope> {
        match self {
            MailboxItem::Deliver(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Topology write executed on the counterpart of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerCommand {
    SetParent(AgentId),
    ClearParent(AgentId),
    RegisterChildren(Vec<AgentId>),
    UnregisterChild(AgentId),
}

pub(crate) fn layer_job<A: Agent>(
    command: LayerCommand,
    reply: oneshot::Sender<Result<(), AgentError>>,
) -> Job<A> {
    job::<A, _>(move |ctx| {
        Box::pin(async move {
            let result = match command {
                LayerCommand::SetParent(parent) => ctx.accept_parent(parent).await,
                LayerCommand::ClearParent(parent) => ctx.release_parent(parent).await,
                LayerCommand::RegisterChildren(children) => ctx.register_children(children).await,
                LayerCommand::UnregisterChild(child) => ctx.unregister_child(&child).await,
            };
            let _ = reply.send(result);
        })
    })
}

/// Resolves to the items a previous activation of the same ID left queued,
/// once that activation has finished.
pub(crate) type Handoff<A> = BoxFuture<'static, Vec<MailboxItem<A>>>;

/// What a finished activation hands back to its owner.
pub(crate) struct ActivationExit<A: Agent> {
    pub agent_id: AgentId,
    pub instance_id: Uuid,
    pub reason: DeactivationReason,
    /// Items still queued when the mailbox closed.
    pub leftovers: Vec<MailboxItem<A>>,
    /// Passes `leftovers` (or nothing) on to the successor.
    pub handoff: oneshot::Sender<Vec<MailboxItem<A>>>,
}

pub(crate) type ExitHook<A> = Box<dyn FnOnce(ActivationExit<A>) + Send>;

/// Everything needed to start one activation.
pub(crate) struct ActivationSpec<A: Agent> {
    pub agent: A,
    pub agent_id: AgentId,
    pub transport: Arc<dyn Transport>,
    pub log_store: Arc<dyn EventLogStore>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub directory: Arc<dyn AgentDirectory>,
    pub bus: RuntimeEventBus,
    pub settings: ActivationSettings,
    /// Queued items of the previous activation, served before this mailbox.
    pub predecessor: Option<Handoff<A>>,
    pub on_exit: ExitHook<A>,
}

/// Caller-side handle of a running activation.
pub struct ActivationHandle<A: Agent> {
    agent_id: AgentId,
    instance_id: Uuid,
    mailbox: mpsc::UnboundedSender<MailboxItem<A>>,
    status: watch::Receiver<AgentStatus>,
    topology: SharedTopology,
    correlator: Arc<Correlator>,
    failure: Arc<Mutex<Option<String>>>,
    handoff: Arc<Mutex<Option<oneshot::Receiver<Vec<MailboxItem<A>>>>>>,
}

impl<A: Agent> Clone for ActivationHandle<A> {
    fn clone(&self) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            instance_id: self.instance_id,
            mailbox: self.mailbox.clone(),
            status: self.status.clone(),
            topology: Arc::clone(&self.topology),
            correlator: Arc::clone(&self.correlator),
            failure: Arc::clone(&self.failure),
            handoff: Arc::clone(&self.handoff),
        }
    }
}

impl<A: Agent> ActivationHandle<A> {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    /// Committed topology as of the last confirm.
    pub fn topology(&self) -> Topology {
        self.topology.read().clone()
    }

    /// Queue an item. Hands it back when the activation no longer accepts
    /// work, so the caller can route it to a fresh activation.
    pub(crate) fn enqueue(&self, item: MailboxItem<A>) -> Result<(), MailboxItem<A>> {
        if !self.status().accepts_work() {
            return Err(item);
        }
        self.mailbox.send(item).map_err(|rejected| rejected.0)
    }

    /// Wait until the activation is `Active`.
    pub async fn wait_ready(&self) -> Result<(), AgentError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| !matches!(s, AgentStatus::Uninitialized | AgentStatus::Activating))
            .await
            .map(|s| *s);
        match reached {
            Ok(AgentStatus::Active) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    pub async fn wait_deactivated(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.is_terminal()).await;
    }

    /// Cancel pending correlations and queue the deactivation behind any
    /// work already in the mailbox.
    pub fn request_deactivation(&self, reason: DeactivationReason) -> bool {
        let cancelled = self.correlator.cancel_all();
        if cancelled > 0 {
            debug!(agent_id = %self.agent_id, cancelled, "Cancelled pending correlations");
        }
        self.mailbox.send(MailboxItem::Deactivate(reason)).is_ok()
    }

    /// Activation failure reason, if the activation never became `Active`.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Items this activation leaves queued, for the one successor that
    /// replaces it. Later callers get nothing.
    pub(crate) fn take_handoff(&self) -> Handoff<A> {
        let receiver = self.handoff.lock().take();
        async move {
            match receiver {
                Some(receiver) => receiver.await.unwrap_or_default(),
                None => Vec::new(),
            }
        }
        .boxed()
    }

    pub(crate) fn closed_error(&self) -> AgentError {
        match self.failure() {
            Some(reason) => AgentError::ActivationFailed {
                agent_id: self.agent_id.clone(),
                reason,
            },
            None => AgentError::Deactivated(self.agent_id.clone()),
        }
    }
}

/// Start an activation task and return its handle immediately.
pub(crate) fn spawn_activation<A: Agent>(spec: ActivationSpec<A>) -> ActivationHandle<A> {
    let ActivationSpec {
        agent,
        agent_id,
        transport,
        log_store,
        snapshots,
        directory,
        bus,
        settings,
        predecessor,
        on_exit,
    } = spec;

    let instance_id = Uuid::new_v4();
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(AgentStatus::Uninitialized);
    let failure = Arc::new(Mutex::new(None));
    let correlator = Arc::new(Correlator::new(agent_id.clone()));
    let (handoff_tx, handoff_rx) = oneshot::channel();

    let mut log = EventLogEngine::<A>::new(agent_id.clone(), log_store).with_event_bus(bus.clone());
    if let Some(store) = snapshots {
        log = log.with_snapshots(store, settings.snapshot_interval);
    }
    let topology = log.topology_handle();

    let ctx = AgentContext::new(
        agent,
        log,
        LayeredRouter::new(agent_id.clone(), Arc::clone(&transport)),
        RelationshipManager::new(directory, settings.max_depth),
        Arc::clone(&correlator),
        settings.default_timeout,
    );

    let activation = Activation {
        instance_id,
        ctx,
        handlers: HandlerTable::for_agent(),
        dedup: DedupWindow::new(settings.dedup_window),
        readers: JoinSet::new(),
        awaiting_readers: HashMap::new(),
        status: status_tx,
        failure: Arc::clone(&failure),
        transport,
        subscription: None,
        sweeper: CancellationToken::new(),
        handoff: handoff_tx,
        bus,
        settings,
    };
    tokio::spawn(activation.run(mailbox_rx, mailbox_tx.clone(), predecessor, on_exit));

    ActivationHandle {
        agent_id,
        instance_id,
        mailbox: mailbox_tx,
        status: status_rx,
        topology,
        correlator,
        failure,
        handoff: Arc::new(Mutex::new(Some(handoff_rx))),
    }
}

type ReaderResult = Result<DedupKey, (EventEnvelope, AgentError)>;

/// How a mutating turn left its envelope.
enum TurnOutcome {
    Succeeded,
    /// Failed without confirming; redelivery may retry it.
    Retryable,
    /// Failed after confirming; redelivery must not apply it again.
    Confirmed,
}

enum Wake<A: Agent> {
    Item(Option<MailboxItem<A>>),
    Reaped(Result<ReaderResult, JoinError>),
    Idle,
}

struct Activation<A: Agent> {
    instance_id: Uuid,
    ctx: AgentContext<A>,
    handlers: HandlerTable<A>,
    dedup: DedupWindow,
    readers: JoinSet<ReaderResult>,
    /// Read-only turns still running per envelope whose key is recorded
    /// once they all succeed.
    awaiting_readers: HashMap<DedupKey, usize>,
    status: watch::Sender<AgentStatus>,
    failure: Arc<Mutex<Option<String>>>,
    transport: Arc<dyn Transport>,
    subscription: Option<SubscriptionHandle>,
    sweeper: CancellationToken,
    handoff: oneshot::Sender<Vec<MailboxItem<A>>>,
    bus: RuntimeEventBus,
    settings: ActivationSettings,
}

impl<A: Agent> Activation<A> {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<MailboxItem<A>>,
        sender: mpsc::UnboundedSender<MailboxItem<A>>,
        predecessor: Option<Handoff<A>>,
        on_exit: ExitHook<A>,
    ) {
        let inherited = match predecessor {
            Some(handoff) => handoff.await,
            None => Vec::new(),
        };
        self.status.send_replace(AgentStatus::Activating);

        if let Err(e) = self.activate(sender).await {
            self.fail(e, inherited, mailbox, on_exit).await;
            return;
        }

        let reason = self.serve(inherited, &mut mailbox).await;
        self.deactivate(reason, mailbox, on_exit).await;
    }

    async fn activate(&mut self, sender: mpsc::UnboundedSender<MailboxItem<A>>) -> Result<(), AgentError> {
        let started = Instant::now();
        let version = self.ctx.log.replay().await?;

        let handler = self.envelope_handler(sender);
        let handle = self.transport.subscribe(self.ctx.id(), handler).await?;
        self.subscription = Some(handle);

        let hook = A::on_activate(&mut self.ctx).await;
        let leftover = self.ctx.discard_pending();
        hook?;
        if leftover > 0 {
            warn!(agent_id = %self.ctx.id(), leftover, "on_activate left events unconfirmed, discarded");
        }

        self.status.send_replace(AgentStatus::Active);
        self.spawn_sweeper();

        metrics::counter!("canopy_activations_total", "agent_type" => A::TYPE_NAME).increment(1);
        metrics::histogram!("canopy_activation_duration_seconds", "agent_type" => A::TYPE_NAME)
            .record(started.elapsed().as_secs_f64());
        self.bus.publish(RuntimeEvent::AgentActivated {
            agent_id: self.ctx.id().clone(),
            version,
            activated_at: Utc::now(),
        });
        info!(agent_id = %self.ctx.id(), version, instance_id = %self.instance_id, "Agent activated");
        Ok(())
    }

    /// Transport callback: replies resolve immediately, everything else
    /// goes through the mailbox.
    fn envelope_handler(&self, sender: mpsc::UnboundedSender<MailboxItem<A>>) -> EnvelopeHandler {
        let agent_id = self.ctx.id().clone();
        let correlator = Arc::clone(&self.ctx.correlator);
        Arc::new(move |envelope: EventEnvelope| {
            let result = if envelope.is_reply() {
                correlator.resolve(envelope);
                Ok(())
            } else {
                sender
                    .send(MailboxItem::Deliver(envelope))
                    .map_err(|_| TransportError::Closed(agent_id.clone()))
            };
            futures::future::ready(result).boxed()
        })
    }

    fn spawn_sweeper(&self) {
        let bus = self.bus.clone();
        let agent_id = self.ctx.id().clone();
        Arc::clone(&self.ctx.correlator).spawn_sweeper(
            self.settings.sweep_interval,
            self.sweeper.clone(),
            move |correlation_id| {
                debug!(agent_id = %agent_id, correlation_id = %correlation_id, "Correlation timed out");
                bus.publish(RuntimeEvent::CorrelationTimedOut {
                    agent_id: agent_id.clone(),
                    correlation_id,
                    timed_out_at: Utc::now(),
                });
            },
        );
    }

    async fn serve(
        &mut self,
        inherited: Vec<MailboxItem<A>>,
        mailbox: &mut mpsc::UnboundedReceiver<MailboxItem<A>>,
    ) -> DeactivationReason {
        if !inherited.is_empty() {
            debug!(agent_id = %self.ctx.id(), inherited = inherited.len(), "Serving items queued before reactivation");
        }
        for item in inherited {
            if let Some(reason) = self.handle(item).await {
                return reason;
            }
        }

        let idle_timeout = self.settings.idle_timeout;
        loop {
            let wake = tokio::select! {
                item = mailbox.recv() => Wake::Item(item),
                Some(joined) = self.readers.join_next(), if !self.readers.is_empty() => Wake::Reaped(joined),
                _ = idle(idle_timeout), if self.readers.is_empty() => Wake::Idle,
            };

            match wake {
                Wake::Item(Some(item)) => {
                    if let Some(reason) = self.handle(item).await {
                        return reason;
                    }
                }
                Wake::Item(None) => return DeactivationReason::Shutdown,
                Wake::Reaped(joined) => self.reap(joined).await,
                Wake::Idle => {
                    debug!(agent_id = %self.ctx.id(), "Idle timeout reached");
                    return DeactivationReason::Idle;
                }
            }
        }
    }

    /// Run one mailbox item. `Some` ends the activation.
    async fn handle(&mut self, item: MailboxItem<A>) -> Option<DeactivationReason> {
        match item {
            MailboxItem::Deliver(envelope) => self.dispatch(envelope).await,
            MailboxItem::Invoke(job) => {
                self.join_readers().await;
                job(&mut self.ctx).await;
                let dropped = self.ctx.discard_pending();
                if dropped > 0 {
                    warn!(agent_id = %self.ctx.id(), dropped, "Invocation left events unconfirmed, discarded");
                }
            }
            MailboxItem::Deactivate(reason) => return Some(reason),
        }
        None
    }

    async fn dispatch(&mut self, envelope: EventEnvelope) {
        if envelope.is_reply() {
            self.ctx.correlator.resolve(envelope);
            return;
        }

        let key = envelope.dedup_key();
        if self.dedup.contains(&key) {
            metrics::counter!("canopy_duplicate_envelopes_total").increment(1);
            debug!(agent_id = %self.ctx.id(), event_id = %envelope.event_id, "Duplicate envelope dropped");
            return;
        }

        let own = envelope.publisher == *self.ctx.id();
        let runnable = |allow_self: bool| !own || allow_self || envelope.route == Route::ToSelf;

        let mut mutating: Vec<MutatingFn<A>> = Vec::new();
        let mut readers: Vec<ReadOnlyFn<A>> = Vec::new();
        let typed = self.handlers.lookup(&envelope.event_type).into_iter();
        for entry in typed.chain(self.handlers.catch_all()) {
            if !runnable(entry.handles_own_events()) {
                continue;
            }
            match &entry.kind {
                HandlerKind::Mutating(handler) => mutating.push(Arc::clone(handler)),
                HandlerKind::ReadOnly(handler) => readers.push(Arc::clone(handler)),
            }
        }

        if readers.is_empty() && mutating.is_empty() {
            metrics::counter!("canopy_dispatch_misses_total", "agent_type" => A::TYPE_NAME).increment(1);
            debug!(
                agent_id = %self.ctx.id(),
                event_type = %envelope.event_type,
                "No handler for envelope, dropped"
            );
            return;
        }

        let mut confirmed = false;
        let mut retryable = false;
        for handler in mutating {
            match self.run_turn(handler, &envelope).await {
                TurnOutcome::Succeeded => {}
                TurnOutcome::Retryable => retryable = true,
                TurnOutcome::Confirmed => confirmed = true,
            }
        }

        // confirmed effects must never be applied twice
        if confirmed || (!retryable && readers.is_empty()) {
            self.dedup.record(key);
        } else if !retryable {
            *self.awaiting_readers.entry(key).or_default() += readers.len();
        }
        for handler in readers {
            self.spawn_reader(handler, &envelope);
        }
    }

    fn spawn_reader(&mut self, handler: ReadOnlyFn<A>, envelope: &EventEnvelope) {
        let owned = envelope.clone();
        let key = envelope.dedup_key();
        let task = handler(self.ctx.read_only(), envelope.clone());
        self.readers
            .spawn(async move { task.await.map(|()| key).map_err(|error| (owned, error)) });
    }

    async fn run_turn(&mut self, handler: MutatingFn<A>, envelope: &EventEnvelope) -> TurnOutcome {
        self.join_readers().await;
        let started = Instant::now();
        let before = self.ctx.version();
        let result = handler(&mut self.ctx, envelope).await;
        let dropped = self.ctx.discard_pending();
        if dropped > 0 {
            warn!(
                agent_id = %self.ctx.id(),
                event_type = %envelope.event_type,
                dropped,
                "Handler left events unconfirmed, discarded"
            );
        }
        metrics::histogram!("canopy_handler_duration_seconds", "agent_type" => A::TYPE_NAME)
            .record(started.elapsed().as_secs_f64());
        match result {
            Ok(()) => TurnOutcome::Succeeded,
            Err(e) => {
                self.report_failure(envelope, &e).await;
                if self.ctx.version() != before {
                    TurnOutcome::Confirmed
                } else {
                    TurnOutcome::Retryable
                }
            }
        }
    }

    async fn join_readers(&mut self) {
        while let Some(joined) = self.readers.join_next().await {
            self.reap(joined).await;
        }
    }

    async fn reap(&mut self, joined: Result<ReaderResult, JoinError>) {
        match joined {
            Ok(Ok(key)) => {
                if let Some(remaining) = self.awaiting_readers.get_mut(&key) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.awaiting_readers.remove(&key);
                        self.dedup.record(key);
                    }
                }
            }
            Ok(Err((envelope, e))) => {
                self.awaiting_readers.remove(&envelope.dedup_key());
                self.report_failure(&envelope, &e).await;
            }
            Err(e) => error!(agent_id = %self.ctx.id(), error = %e, "Read-only handler task aborted"),
        }
    }

    /// Log, publish on the bus and tell whoever is waiting on the envelope.
    async fn report_failure(&mut self, envelope: &EventEnvelope, failure: &AgentError) {
        let me = self.ctx.id().clone();
        metrics::counter!("canopy_handler_failures_total", "agent_type" => A::TYPE_NAME).increment(1);
        warn!(
            agent_id = %me,
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            error = %failure,
            "Handler failed"
        );
        self.bus.publish(RuntimeEvent::HandlerFailed {
            agent_id: me.clone(),
            event_type: envelope.event_type.clone(),
            event_id: envelope.event_id,
            reason: failure.to_string(),
            failed_at: Utc::now(),
        });

        if envelope.is::<HandlerFailed>() {
            return;
        }
        let notice = HandlerFailed {
            agent_id: me.clone(),
            event_type: envelope.event_type.clone(),
            event_id: envelope.event_id,
            reason: failure.to_string(),
        };
        let (target, correlation) = match &envelope.correlation {
            Some(Correlation::Request { id, reply_to }) => {
                (reply_to.clone(), Some(Correlation::Reply { id: *id }))
            }
            _ if self.settings.report_handler_failures && envelope.publisher != me => {
                (envelope.publisher.clone(), None)
            }
            _ => return,
        };

        let notification = match EventEnvelope::new(&notice, me.clone(), Route::PointToPoint) {
            Ok(notification) => match correlation {
                Some(correlation) => notification.with_correlation(correlation),
                None => notification,
            },
            Err(e) => {
                error!(agent_id = %me, error = %e, "Failed to encode handler failure notice");
                return;
            }
        };
        if let Err(e) = self.ctx.router.send_to(&target, notification).await {
            debug!(agent_id = %me, target = %target, error = %e, "Handler failure notice not delivered");
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(handle) = self.subscription.take() {
            if let Err(e) = self.transport.unsubscribe(&handle).await {
                warn!(agent_id = %self.ctx.id(), error = %e, "Failed to unsubscribe");
            }
        }
    }

    async fn deactivate(
        mut self,
        reason: DeactivationReason,
        mut mailbox: mpsc::UnboundedReceiver<MailboxItem<A>>,
        on_exit: ExitHook<A>,
    ) {
        let agent_id = self.ctx.id().clone();
        self.status.send_replace(AgentStatus::Deactivating);
        self.unsubscribe().await;

        mailbox.close();
        let mut leftovers = Vec::new();
        while let Ok(item) = mailbox.try_recv() {
            if !matches!(item, MailboxItem::Deactivate(_)) {
                leftovers.push(item);
            }
        }

        self.join_readers().await;
        self.sweeper.cancel();
        let cancelled = self.ctx.correlator.cancel_all();

        if let Err(e) = A::on_deactivate(&mut self.ctx).await {
            warn!(agent_id = %agent_id, error = %e, "on_deactivate failed");
        }
        self.ctx.discard_pending();

        self.status.send_replace(AgentStatus::Deactivated);
        metrics::counter!("canopy_deactivations_total", "reason" => reason.to_string()).increment(1);
        self.bus.publish(RuntimeEvent::AgentDeactivated {
            agent_id: agent_id.clone(),
            reason,
            deactivated_at: Utc::now(),
        });
        info!(
            agent_id = %agent_id,
            %reason,
            cancelled,
            leftovers = leftovers.len(),
            "Agent deactivated"
        );

        on_exit(ActivationExit {
            agent_id,
            instance_id: self.instance_id,
            reason,
            leftovers,
            handoff: self.handoff,
        });
    }

    async fn fail(
        mut self,
        failure: AgentError,
        inherited: Vec<MailboxItem<A>>,
        mut mailbox: mpsc::UnboundedReceiver<MailboxItem<A>>,
        on_exit: ExitHook<A>,
    ) {
        let agent_id = self.ctx.id().clone();
        let reason = failure.to_string();
        error!(agent_id = %agent_id, error = %reason, "Activation failed");
        *self.failure.lock() = Some(reason.clone());
        self.status.send_replace(AgentStatus::Deactivating);
        self.unsubscribe().await;

        mailbox.close();
        let mut dropped = inherited
            .into_iter()
            .filter_map(MailboxItem::into_envelope)
            .count() as u64;
        while let Ok(item) = mailbox.try_recv() {
            if item.into_envelope().is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            metrics::counter!("canopy_envelopes_dropped_total", "reason" => "activation_failed")
                .increment(dropped);
        }
        self.ctx.correlator.cancel_all();
        self.ctx.discard_pending();

        self.status.send_replace(AgentStatus::Deactivated);
        metrics::counter!("canopy_activation_failures_total", "agent_type" => A::TYPE_NAME).increment(1);
        self.bus.publish(RuntimeEvent::ActivationFailed {
            agent_id: agent_id.clone(),
            reason,
            failed_at: Utc::now(),
        });

        on_exit(ActivationExit {
            agent_id,
            instance_id: self.instance_id,
            reason: DeactivationReason::ActivationFailed,
            leftovers: Vec::new(),
            handoff: self.handoff,
        });
    }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::RuntimeConfigManifest;

    #[test]
    fn settings_follow_config() {
        let manifest = RuntimeConfigManifest::from_yaml_str(
            r#"
apiVersion: canopy.dev/v1
kind: RuntimeConfig
metadata:
  name: test
spec:
  correlation:
    default_timeout: 5s
  activation:
    idle_timeout: 2m
  dispatch:
    dedup_window: 16
"#,
        )
        .unwrap();

        let settings = ActivationSettings::from(&manifest.spec);
        assert_eq!(settings.default_timeout, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.dedup_window, 16);
        assert_eq!(settings.max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn only_deliveries_carry_envelopes() {
        struct Inert;
        impl Agent for Inert {
            const TYPE_NAME: &'static str = "inert";
            type State = ();
            type LogEvent = ();
            fn transition(_: &mut (), _: &()) {}
            fn register_handlers(_: &mut HandlerTable<Self>) {}
        }

        let item: MailboxItem<Inert> = MailboxItem::Deactivate(DeactivationReason::Idle);
        assert!(item.into_envelope().is_none());
    }
}
