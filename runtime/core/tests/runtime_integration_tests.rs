// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for activation, dispatch and layered publishing through
//! the full runtime.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canopy_core::application::correlator::{CorrelationError, ResponseOutcome, ResponseRoute};
use canopy_core::domain::events::{Route, RuntimeEvent};
use canopy_core::domain::identity::EventId;
use canopy_core::{
    ActivationRuntime, ActivationSettings, AgentError, AgentId, AgentStatus, DeactivationReason,
    EventEnvelope,
};
use common::*;

fn runtime_with(transport: Arc<RecordingTransport>) -> ActivationRuntime {
    let runtime = ActivationRuntime::builder().with_transport(transport).build();
    runtime.register::<Node>();
    runtime
}

/// Scenario A: one publish per child, all carrying the same event ID.
#[tokio::test]
async fn test_downward_publish_reaches_each_child_once() {
    let transport = RecordingTransport::new();
    let runtime = runtime_with(transport.clone());
    let parent = runtime.get::<Node>("p");
    parent
        .register_children(vec![node("c1"), node("c2")])
        .await
        .unwrap();
    transport.clear();

    parent.send(&Broadcast { text: "hello".into() }).await.unwrap();

    for key in ["c1", "c2"] {
        let child = runtime.get::<Node>(key);
        eventually("child received the announcement", || {
            let child = child.clone();
            async move { child.state().await.unwrap().received == vec!["hello".to_string()] }
        })
        .await;
    }

    let announcements = transport.published_of::<Announce>();
    assert_eq!(announcements.len(), 2);
    let targets: BTreeSet<AgentId> = announcements.iter().map(|(t, _)| t.clone()).collect();
    assert_eq!(targets, [node("c1"), node("c2")].into_iter().collect());
    let ids: BTreeSet<EventId> = announcements.iter().map(|(_, e)| e.event_id).collect();
    assert_eq!(ids.len(), 1);
    assert!(announcements.iter().all(|(_, e)| e.route == Route::Downward));
    assert!(announcements.iter().all(|(_, e)| e.publisher == node("p")));
}

/// Scenario B: a failed confirm leaves the committed state untouched.
#[tokio::test]
async fn test_failed_confirm_discards_staged_events() {
    let store = FlakyLogStore::new();
    let runtime = ActivationRuntime::builder().with_log_store(store.clone()).build();
    runtime.register::<Node>();
    let wallet = runtime.get::<Node>("wallet");
    wallet.activate().await.unwrap();
    store.fail_appends(true);

    let (before, failed, after, again) = wallet
        .invoke(|ctx| {
            Box::pin(async move {
                let before = ctx.state().clone();
                ctx.stage(NodeEvent::Deposited { amount: 1 });
                ctx.stage(NodeEvent::Deposited { amount: 2 });
                assert_eq!(ctx.staged_state().balance, 3);
                let failed = ctx.confirm().await;
                let after = ctx.state().clone();
                let again = ctx.confirm().await;
                (before, failed, after, again)
            })
        })
        .await
        .unwrap();

    assert!(matches!(failed, Err(AgentError::PersistenceFailure { count: 2, .. })));
    assert_eq!(before, after);
    assert_eq!(again.unwrap(), 0);

    // the turn is over, the agent keeps serving
    store.fail_appends(false);
    wallet.send(&Deposit { amount: 4 }).await.unwrap();
    assert_eq!(wallet.state().await.unwrap().balance, 4);
}

#[tokio::test]
async fn test_redelivered_envelope_is_applied_once() {
    let transport = RecordingTransport::new();
    let runtime = runtime_with(transport.clone());
    let wallet = runtime.get::<Node>("wallet");
    wallet.activate().await.unwrap();

    let envelope = EventEnvelope::new(
        &Deposit { amount: 5 },
        runtime.client_id().clone(),
        Route::PointToPoint,
    )
    .unwrap();
    let transport_port = runtime.transport();
    transport_port.publish(wallet.id(), envelope.clone()).await.unwrap();
    transport_port.publish(wallet.id(), envelope).await.unwrap();

    let state = wallet.state().await.unwrap();
    assert_eq!(state.balance, 5);
    assert_eq!(wallet.version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_redelivery_after_confirmed_failure_is_not_reapplied() {
    let runtime = runtime_with(RecordingTransport::new());
    let mut bus = runtime.event_bus().subscribe();
    let wallet = runtime.get::<Node>("settler");
    wallet.activate().await.unwrap();

    let envelope = EventEnvelope::new(
        &Settle { amount: 5 },
        runtime.client_id().clone(),
        Route::PointToPoint,
    )
    .unwrap();
    let transport_port = runtime.transport();
    transport_port.publish(wallet.id(), envelope.clone()).await.unwrap();
    transport_port.publish(wallet.id(), envelope).await.unwrap();

    assert_eq!(wallet.state().await.unwrap().balance, 5);
    assert_eq!(wallet.version().await.unwrap(), 1);

    let mut failures = 0;
    while let Ok(event) = bus.try_recv() {
        if matches!(event, RuntimeEvent::HandlerFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_redelivery_retries_turn_that_never_confirmed() {
    let store = FlakyLogStore::new();
    let runtime = ActivationRuntime::builder().with_log_store(store.clone()).build();
    runtime.register::<Node>();
    let wallet = runtime.get::<Node>("retry");
    wallet.activate().await.unwrap();

    let envelope = EventEnvelope::new(
        &Deposit { amount: 5 },
        runtime.client_id().clone(),
        Route::PointToPoint,
    )
    .unwrap();
    let transport_port = runtime.transport();

    store.fail_appends(true);
    transport_port.publish(wallet.id(), envelope.clone()).await.unwrap();
    assert_eq!(wallet.version().await.unwrap(), 0);

    store.fail_appends(false);
    transport_port.publish(wallet.id(), envelope.clone()).await.unwrap();
    transport_port.publish(wallet.id(), envelope).await.unwrap();
    assert_eq!(wallet.state().await.unwrap().balance, 5);
    assert_eq!(wallet.version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_read_only_turn_is_retried_on_redelivery() {
    let runtime = runtime_with(RecordingTransport::new());
    let subject = runtime.get::<Node>("audited");
    let auditor = runtime.get::<Node>("auditor");
    subject.activate().await.unwrap();

    let envelope = EventEnvelope::new(
        &Audit {
            reply_to: auditor.id().clone(),
        },
        runtime.client_id().clone(),
        Route::PointToPoint,
    )
    .unwrap();
    let transport_port = runtime.transport();

    // fails on an empty balance; the deposit turn joins it first
    transport_port.publish(subject.id(), envelope.clone()).await.unwrap();
    subject.send(&Deposit { amount: 3 }).await.unwrap();

    transport_port.publish(subject.id(), envelope.clone()).await.unwrap();
    subject.state().await.unwrap();
    transport_port.publish(subject.id(), envelope).await.unwrap();
    subject.state().await.unwrap();

    assert_eq!(auditor.state().await.unwrap().received, vec!["audit:3".to_string()]);
}

#[tokio::test]
async fn test_sender_order_survives_reactivation() {
    let runtime = ActivationRuntime::new();
    runtime.register::<Journal>();
    let journal = runtime.get::<Journal>("j");
    journal.activate().await.unwrap();

    let busy = journal.clone();
    let slow_turn = tokio::spawn(async move {
        busy.invoke::<(), _>(|_| Box::pin(tokio::time::sleep(Duration::from_millis(100))))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let leaving = journal.clone();
    let deactivation = tokio::spawn(async move { leaving.deactivate().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // queued behind the deactivation request
    assert_eq!(journal.status(), AgentStatus::Active);
    journal.send(&Note { text: "1".into() }).await.unwrap();

    eventually("journal started deactivating", || {
        let journal = journal.clone();
        async move { journal.status() == AgentStatus::Deactivating }
    })
    .await;
    journal.send(&Note { text: "2".into() }).await.unwrap();

    assert_eq!(journal.state().await.unwrap(), vec!["1".to_string(), "2".to_string()]);
    slow_turn.await.unwrap().unwrap();
    assert!(deactivation.await.unwrap());
}

#[tokio::test]
async fn test_unhandled_event_is_dropped_silently() {
    let runtime = runtime_with(RecordingTransport::new());
    let agent = runtime.get::<Node>("quiet");

    agent.send(&Unknown).await.unwrap();
    agent.send(&Deposit { amount: 1 }).await.unwrap();

    assert_eq!(agent.state().await.unwrap().balance, 1);
    assert_eq!(agent.status(), AgentStatus::Active);
    assert!(!agent.subscribed_events().contains(&"test.unknown"));
}

#[tokio::test]
async fn test_publish_to_self_runs_in_later_turn() {
    let runtime = runtime_with(RecordingTransport::new());
    let agent = runtime.get::<Node>("solo");

    agent.send(&Defer { text: "later".into() }).await.unwrap();

    eventually("deferred announcement handled", || {
        let agent = agent.clone();
        async move { agent.state().await.unwrap().received == vec!["later".to_string()] }
    })
    .await;
}

#[tokio::test]
async fn test_publish_refused_while_events_unconfirmed() {
    let runtime = runtime_with(RecordingTransport::new());
    let agent = runtime.get::<Node>("careful");

    let result = agent
        .invoke(|ctx| {
            Box::pin(async move {
                ctx.stage(NodeEvent::Deposited { amount: 9 });
                ctx.publish_to_self(&Announce { text: "too early".into() }).await
            })
        })
        .await
        .unwrap();

    assert!(matches!(result, Err(AgentError::UnconfirmedEvents { pending: 1, .. })));
    // unconfirmed events die with the turn
    assert_eq!(agent.state().await.unwrap().balance, 0);
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let runtime = runtime_with(RecordingTransport::new());
    let oracle = runtime.get::<Node>("oracle");

    let outcome = oracle
        .request(&Ask { question: "ping".into() }, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    let answer: Answer = outcome.into_reply().unwrap();
    assert_eq!(answer.echo, "ping");
    assert_eq!(answer.by, "node/oracle");
}

#[tokio::test]
async fn test_agent_to_agent_request_with_response() {
    let runtime = runtime_with(RecordingTransport::new());
    let asker = runtime.get::<Node>("asker");

    let outcome = asker
        .invoke(|ctx| {
            Box::pin(async move {
                ctx.publish_with_response(
                    &Ask { question: "who".into() },
                    ResponseRoute::To(node("oracle")),
                    Some(Duration::from_secs(1)),
                )
                .await
            })
        })
        .await
        .unwrap()
        .unwrap();

    let answer: Answer = outcome.into_reply().unwrap();
    assert_eq!(answer.by, "node/oracle");
}

#[tokio::test]
async fn test_handler_failure_answers_request() {
    let runtime = runtime_with(RecordingTransport::new());
    let mut bus = runtime.event_bus().subscribe();
    let target = runtime.get::<Node>("volatile");

    let outcome = target
        .request(&Explode, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    match outcome.into_reply::<Answer>() {
        Err(CorrelationError::HandlerFailed(failure)) => {
            assert_eq!(failure.agent_id, node("volatile"));
            assert_eq!(failure.event_type, "test.explode");
            assert!(failure.reason.contains("exploded"));
        }
        other => panic!("expected handler failure, got {other:?}"),
    }

    let mut saw_failure = false;
    while let Ok(event) = bus.try_recv() {
        saw_failure |= matches!(event, RuntimeEvent::HandlerFailed { .. });
    }
    assert!(saw_failure);
    // failures are confined to the turn
    assert_eq!(target.status(), AgentStatus::Active);
}

#[tokio::test]
async fn test_activation_hook_failure_is_retried_by_caller() {
    let runtime = ActivationRuntime::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let shared = attempts.clone();
    runtime.register_agent_type(move |_| Fragile {
        attempts: shared.clone(),
    });
    let id = AgentId::new("fragile", "f1");

    let first = runtime.activate(&id).await;
    assert!(matches!(first, Err(AgentError::ActivationFailed { .. })));

    runtime.activate(&id).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.status(&id), AgentStatus::Active);

    runtime.send(&id, &Deposit { amount: 3 }).await.unwrap();
    let fragile = runtime.get_by_id::<Fragile>(id).unwrap();
    assert_eq!(fragile.state().await.unwrap(), 3);
}

#[tokio::test]
async fn test_deactivation_cancels_pending_correlations() {
    let runtime = runtime_with(RecordingTransport::new());
    let asker = runtime.get::<Node>("asker");

    let pending = asker
        .invoke(|ctx| {
            Box::pin(async move {
                ctx.publish_request(
                    &Ask { question: "anyone?".into() },
                    ResponseRoute::To(AgentId::new("ghost", "g")),
                    Some(Duration::from_secs(60)),
                )
                .await
            })
        })
        .await
        .unwrap()
        .unwrap();

    assert!(asker.deactivate().await);
    assert!(matches!(pending.wait().await, ResponseOutcome::Cancelled { .. }));
}

/// Scenario D: an unanswered request resolves as timed out and leaves no
/// pending entry behind.
#[tokio::test(start_paused = true)]
async fn test_request_to_unreachable_target_times_out() {
    let runtime = runtime_with(RecordingTransport::new());
    let asker = runtime.get::<Node>("asker");

    let pending = asker
        .invoke(|ctx| {
            Box::pin(async move {
                ctx.publish_request(
                    &Ask { question: "hello?".into() },
                    ResponseRoute::To(AgentId::new("ghost", "g")),
                    Some(Duration::from_millis(100)),
                )
                .await
            })
        })
        .await
        .unwrap()
        .unwrap();
    let correlation_id = pending.correlation_id();

    let started = tokio::time::Instant::now();
    let outcome = pending.wait().await;
    assert!(outcome.is_timed_out());
    assert!(started.elapsed() >= Duration::from_millis(100));

    let still_pending = asker
        .invoke(move |ctx| Box::pin(futures::future::ready(ctx.is_awaiting(&correlation_id))))
        .await
        .unwrap();
    assert!(!still_pending);
}

#[tokio::test(start_paused = true)]
async fn test_client_request_without_reply_times_out() {
    let runtime = runtime_with(RecordingTransport::new());
    let wallet = runtime.get::<Node>("silent");

    let started = tokio::time::Instant::now();
    let outcome = wallet
        .request(&Deposit { amount: 1 }, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(outcome.is_timed_out());
    assert!(started.elapsed() >= Duration::from_millis(100));
    // the handler still ran; it just never replies
    assert_eq!(wallet.state().await.unwrap().balance, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_agent_deactivates_and_replays_on_next_message() {
    let settings = ActivationSettings {
        idle_timeout: Some(Duration::from_millis(50)),
        ..ActivationSettings::default()
    };
    let runtime = ActivationRuntime::builder().with_settings(settings).build();
    runtime.register::<Node>();
    let mut bus = runtime.event_bus().subscribe();
    let wallet = runtime.get::<Node>("sleepy");

    wallet.send(&Deposit { amount: 5 }).await.unwrap();
    assert_eq!(wallet.state().await.unwrap().balance, 5);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(wallet.status(), AgentStatus::Uninitialized);

    let mut idle = false;
    while let Ok(event) = bus.try_recv() {
        idle |= matches!(
            event,
            RuntimeEvent::AgentDeactivated {
                reason: DeactivationReason::Idle,
                ..
            }
        );
    }
    assert!(idle);

    wallet.send(&Deposit { amount: 7 }).await.unwrap();
    assert_eq!(wallet.state().await.unwrap().balance, 12);
}

#[tokio::test]
async fn test_read_only_handler_reads_committed_state() {
    let runtime = runtime_with(RecordingTransport::new());
    let subject = runtime.get::<Node>("subject");
    let observer = runtime.get::<Node>("observer");
    subject.send(&Announce { text: "one".into() }).await.unwrap();

    subject
        .send(&Peek {
            reply_to: observer.id().clone(),
        })
        .await
        .unwrap();

    eventually("observer got the peek report", || {
        let observer = observer.clone();
        async move { observer.state().await.unwrap().received == vec!["peek:1".to_string()] }
    })
    .await;
}

#[tokio::test]
async fn test_lifecycle_events_reach_the_bus() {
    let runtime = runtime_with(RecordingTransport::new());
    let mut events = runtime.event_bus().subscribe_agent(node("watched"));
    let agent = runtime.get::<Node>("watched");

    agent.activate().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::AgentActivated { version: 0, .. }
    ));

    agent.send(&Deposit { amount: 1 }).await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::StateConfirmed { version: 1, event_count: 1, .. }
    ));

    assert!(agent.deactivate().await);
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::AgentDeactivated {
            reason: DeactivationReason::Requested,
            ..
        }
    ));
    assert!(runtime.active_agents().is_empty());
}

#[tokio::test]
async fn test_shutdown_refuses_new_activations() {
    let runtime = runtime_with(RecordingTransport::new());
    let agent = runtime.get::<Node>("last");
    agent.activate().await.unwrap();

    runtime.shutdown().await;

    assert!(matches!(agent.activate().await, Err(AgentError::Deactivated(_))));
    assert!(matches!(
        runtime.send(&node("other"), &Deposit { amount: 1 }).await,
        Err(AgentError::Transport(_))
    ));
}

#[tokio::test]
async fn test_unknown_agent_type_is_rejected() {
    let runtime = ActivationRuntime::new();
    let err = runtime
        .send(&AgentId::new("nobody", "1"), &Deposit { amount: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::UnknownAgentType(t) if t == "nobody"));
}
