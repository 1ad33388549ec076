// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request/Response Correlator
//!
//! Tracks requests published by one activation that still await a reply.
//! Each entry holds a deadline and a oneshot continuation; it is removed by
//! exactly one of: a matching reply, the deadline sweep, or deactivation.
//! Deadlines are only checked by the periodic sweep.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::events::{BusinessEvent, Correlation, EnvelopeError, EventEnvelope, HandlerFailed};
use crate::domain::identity::{AgentId, CorrelationId};

/// Where a request is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRoute {
    Upward,
    Downward,
    To(AgentId),
}

/// How a pending request ended.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Reply(EventEnvelope),
    TimedOut { correlation_id: CorrelationId },
    Cancelled { correlation_id: CorrelationId },
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("request {0} timed out")]
    TimedOut(CorrelationId),

    #[error("request {0} was cancelled")]
    Cancelled(CorrelationId),

    #[error("{} failed to handle '{}': {}", .0.agent_id, .0.event_type, .0.reason)]
    HandlerFailed(HandlerFailed),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl ResponseOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, ResponseOutcome::TimedOut { .. })
    }

    /// Decode the reply, mapping timeout, cancellation and remote handler
    /// failures to errors.
    pub fn into_reply<E: BusinessEvent>(self) -> Result<E, CorrelationError> {
        match self {
            ResponseOutcome::Reply(envelope) => {
                if envelope.is::<HandlerFailed>() {
                    return Err(CorrelationError::HandlerFailed(envelope.decode()?));
                }
                Ok(envelope.decode()?)
            }
            ResponseOutcome::TimedOut { correlation_id } => Err(CorrelationError::TimedOut(correlation_id)),
            ResponseOutcome::Cancelled { correlation_id } => Err(CorrelationError::Cancelled(correlation_id)),
        }
    }
}

/// Continuation returned to the requester.
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<ResponseOutcome>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait until the reply arrives, the deadline is swept, or the owning
    /// activation is torn down.
    pub async fn wait(self) -> ResponseOutcome {
        let correlation_id = self.correlation_id;
        self.receiver
            .await
            .unwrap_or(ResponseOutcome::Cancelled { correlation_id })
    }
}

#[derive(Debug)]
struct PendingCorrelation {
    deadline: Instant,
    reply_tx: oneshot::Sender<ResponseOutcome>,
}

/// Pending correlations of one activation.
pub struct Correlator {
    owner: AgentId,
    pending: DashMap<CorrelationId, PendingCorrelation>,
}

impl Correlator {
    pub fn new(owner: AgentId) -> Self {
        Self {
            owner,
            pending: DashMap::new(),
        }
    }

    /// Record a new pending request expiring after `timeout`.
    pub fn register(&self, timeout: Duration) -> PendingResponse {
        let correlation_id = CorrelationId::new();
        let (reply_tx, receiver) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingCorrelation {
                deadline: Instant::now() + timeout,
                reply_tx,
            },
        );
        debug!(agent_id = %self.owner, correlation_id = %correlation_id, ?timeout, "Request registered");
        PendingResponse {
            correlation_id,
            receiver,
        }
    }

    /// Remove a pending entry without resolving it (e.g. its publish failed).
    pub fn abandon(&self, correlation_id: CorrelationId) {
        self.pending.remove(&correlation_id);
    }

    /// Complete the request matching `reply`. Unknown, expired and duplicate
    /// replies return `false` and are dropped.
    pub fn resolve(&self, reply: EventEnvelope) -> bool {
        let Some(Correlation::Reply { id }) = reply.correlation else {
            return false;
        };
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                // the requester may have given up waiting
                let _ = pending.reply_tx.send(ResponseOutcome::Reply(reply));
                metrics::counter!("canopy_correlations_resolved_total").increment(1);
                true
            }
            None => {
                debug!(agent_id = %self.owner, correlation_id = %id, "Dropping reply with no pending request");
                metrics::counter!("canopy_correlation_replies_dropped_total").increment(1);
                false
            }
        }
    }

    /// Fail every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<CorrelationId> {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut timed_out = Vec::with_capacity(expired.len());
        for correlation_id in expired {
            // a reply may have won the race since the scan
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                let _ = pending.reply_tx.send(ResponseOutcome::TimedOut { correlation_id });
                timed_out.push(correlation_id);
            }
        }

        if !timed_out.is_empty() {
            metrics::counter!("canopy_correlation_timeouts_total").increment(timed_out.len() as u64);
            warn!(agent_id = %self.owner, count = timed_out.len(), "Requests timed out");
        }
        timed_out
    }

    /// Fail every entry with a cancellation outcome.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for correlation_id in ids {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                let _ = pending.reply_tx.send(ResponseOutcome::Cancelled { correlation_id });
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            metrics::counter!("canopy_correlations_cancelled_total").increment(cancelled as u64);
            debug!(agent_id = %self.owner, cancelled, "Pending requests cancelled");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Run [`Correlator::sweep`] every `interval` until `token` is cancelled.
    pub fn spawn_sweeper<F>(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
        on_timeout: F,
    ) -> JoinHandle<()>
    where
        F: Fn(CorrelationId) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for correlation_id in self.sweep(Instant::now()) {
                            on_timeout(correlation_id);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::Route;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Answer(u32);

    impl BusinessEvent for Answer {
        const EVENT_TYPE: &'static str = "test.answer";
    }

    fn reply(id: CorrelationId, n: u32) -> EventEnvelope {
        EventEnvelope::new(&Answer(n), AgentId::new("peer", "p"), Route::PointToPoint)
            .unwrap()
            .with_correlation(Correlation::Reply { id })
    }

    #[tokio::test]
    async fn test_second_reply_is_dropped() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        let pending = correlator.register(Duration::from_secs(5));
        let id = pending.correlation_id();

        assert!(correlator.resolve(reply(id, 1)));
        assert!(!correlator.resolve(reply(id, 2)));
        assert_eq!(correlator.pending_count(), 0);

        let answer: Answer = pending.wait().await.into_reply().unwrap();
        assert_eq!(answer, Answer(1));
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_resolved() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        let pending = correlator.register(Duration::from_secs(5));
        let id = pending.correlation_id();
        let mut waiting = tokio_test::task::spawn(pending.wait());

        tokio_test::assert_pending!(waiting.poll());
        assert!(correlator.resolve(reply(id, 7)));
        assert!(waiting.is_woken());
        let outcome = tokio_test::assert_ready!(waiting.poll());
        assert_eq!(outcome.into_reply::<Answer>().unwrap(), Answer(7));
    }

    #[tokio::test]
    async fn test_unknown_reply_is_dropped() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        assert!(!correlator.resolve(reply(CorrelationId::new(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_only_expired_entries() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        let short = correlator.register(Duration::from_millis(100));
        let long = correlator.register(Duration::from_secs(10));

        tokio::time::advance(Duration::from_millis(100)).await;
        let expired = correlator.sweep(Instant::now());
        assert_eq!(expired, vec![short.correlation_id()]);
        assert!(!correlator.is_pending(&short.correlation_id()));
        assert!(correlator.is_pending(&long.correlation_id()));
        assert!(short.wait().await.is_timed_out());

        // reply after the deadline no longer resolves anything
        assert!(!correlator.resolve(reply(expired[0], 9)));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_with_cancellation() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        let first = correlator.register(Duration::from_secs(5));
        let second = correlator.register(Duration::from_secs(5));

        assert_eq!(correlator.cancel_all(), 2);
        assert!(matches!(first.wait().await, ResponseOutcome::Cancelled { .. }));
        assert!(matches!(
            second.wait().await.into_reply::<Answer>(),
            Err(CorrelationError::Cancelled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_reports_timeouts() {
        let correlator = Arc::new(Correlator::new(AgentId::new("asker", "a")));
        let token = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = correlator.clone().spawn_sweeper(Duration::from_millis(25), token.clone(), move |id| {
            let _ = tx.send(id);
        });

        let pending = correlator.register(Duration::from_millis(100));
        let id = pending.correlation_id();
        let outcome = pending.wait().await;
        assert!(outcome.is_timed_out());
        assert_eq!(rx.recv().await.unwrap(), id);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_reply_maps_to_error() {
        let correlator = Correlator::new(AgentId::new("asker", "a"));
        let pending = correlator.register(Duration::from_secs(5));
        let failure = HandlerFailed {
            agent_id: AgentId::new("peer", "p"),
            event_type: Answer::EVENT_TYPE.to_string(),
            event_id: crate::domain::identity::EventId::new(),
            reason: "boom".to_string(),
        };
        let envelope = EventEnvelope::new(&failure, AgentId::new("peer", "p"), Route::PointToPoint)
            .unwrap()
            .with_correlation(Correlation::Reply { id: pending.correlation_id() });
        correlator.resolve(envelope);

        let err = pending.wait().await.into_reply::<Answer>().unwrap_err();
        assert!(matches!(err, CorrelationError::HandlerFailed(f) if f.reason == "boom"));
    }
}
