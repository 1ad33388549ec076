// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for parent/child registration across live agents.

mod common;

use std::sync::Arc;
use std::time::Duration;

use canopy_core::domain::events::RuntimeEvent;
use canopy_core::domain::relationship::{RelationshipDiscrepancy, RelationshipError};
use canopy_core::domain::repository::LogEntry;
use canopy_core::infrastructure::InMemoryEventLogStore;
use canopy_core::{ActivationRuntime, AgentError, StateLogEvent};
use chrono::Utc;
use common::*;

fn runtime() -> ActivationRuntime {
    let runtime = ActivationRuntime::new();
    runtime.register::<Node>();
    runtime
}

fn is_cycle(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::Relationship(RelationshipError::CycleDetected { .. })
    )
}

#[tokio::test]
async fn test_register_child_links_both_agents() {
    let runtime = runtime();
    let parent = runtime.get::<Node>("p");
    let child = runtime.get::<Node>("c");

    parent.register_child(child.id()).await.unwrap();

    assert_eq!(parent.children().await.unwrap(), vec![node("c")]);
    assert_eq!(child.parent().await.unwrap(), Some(node("p")));
    assert!(parent.validate_relationship().await.unwrap().is_empty());
    assert!(child.validate_relationship().await.unwrap().is_empty());
}

/// Scenario C: the reverse registration is a cycle and changes nothing.
#[tokio::test]
async fn test_reverse_registration_is_rejected_as_cycle() {
    let runtime = runtime();
    let a = runtime.get::<Node>("a");
    let b = runtime.get::<Node>("b");
    a.register_child(b.id()).await.unwrap();
    let a_before = a.committed().await.unwrap();
    let b_before = b.committed().await.unwrap();

    let err = b.register_child(a.id()).await.unwrap_err();

    assert!(is_cycle(&err), "unexpected error: {err:?}");
    assert_eq!(*a.committed().await.unwrap(), *a_before);
    assert_eq!(*b.committed().await.unwrap(), *b_before);
    assert_eq!(a.version().await.unwrap(), 1);
    assert_eq!(b.version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transitive_ancestor_is_rejected() {
    let runtime = runtime();
    let chain: Vec<_> = ["n0", "n1", "n2", "n3", "n4"]
        .iter()
        .map(|key| runtime.get::<Node>(*key))
        .collect();
    for pair in chain.windows(2) {
        pair[0].register_child(pair[1].id()).await.unwrap();
    }

    let err = chain[4].register_child(chain[0].id()).await.unwrap_err();
    assert!(is_cycle(&err));
    assert!(chain[4].children().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_self_registration_is_rejected() {
    let runtime = runtime();
    let a = runtime.get::<Node>("a");

    let err = a.register_child(a.id()).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Relationship(RelationshipError::SelfRegistration { .. })
    ));
}

#[tokio::test]
async fn test_child_cannot_have_two_parents() {
    let runtime = runtime();
    let first = runtime.get::<Node>("first");
    let second = runtime.get::<Node>("second");
    let child = runtime.get::<Node>("child");
    first.register_child(child.id()).await.unwrap();

    let err = second.register_child(child.id()).await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::Relationship(RelationshipError::AlreadyHasParent { .. })
    ));
    assert!(second.children().await.unwrap().is_empty());
    assert_eq!(child.parent().await.unwrap(), Some(node("first")));
}

#[tokio::test]
async fn test_batch_registration_confirms_once() {
    let runtime = runtime();
    let mut confirms = runtime.event_bus().subscribe_agent(node("hub"));
    let hub = runtime.get::<Node>("hub");

    hub.register_children(vec![node("s1"), node("s2"), node("s3")])
        .await
        .unwrap();

    assert_eq!(
        hub.children().await.unwrap(),
        vec![node("s1"), node("s2"), node("s3")]
    );
    for key in ["s1", "s2", "s3"] {
        let spoke = runtime.get::<Node>(key);
        assert_eq!(spoke.parent().await.unwrap(), Some(node("hub")));
    }

    assert_eq!(hub.version().await.unwrap(), 3);

    let confirmed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = confirms.recv().await.unwrap();
            if let RuntimeEvent::StateConfirmed { version, event_count, .. } = event {
                break (version, event_count);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(confirmed, (3, 3));
}

#[tokio::test]
async fn test_unregister_clears_both_sides() {
    let runtime = runtime();
    let parent = runtime.get::<Node>("p");
    let child = runtime.get::<Node>("c");
    parent.register_child(child.id()).await.unwrap();

    parent.unregister_child(child.id()).await.unwrap();

    assert!(parent.children().await.unwrap().is_empty());
    assert_eq!(child.parent().await.unwrap(), None);
    // the child is free to join another parent
    runtime
        .get::<Node>("q")
        .register_child(child.id())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_topology_survives_reactivation() {
    let runtime = runtime();
    let parent = runtime.get::<Node>("p");
    parent
        .register_children(vec![node("c1"), node("c2")])
        .await
        .unwrap();

    assert!(parent.deactivate().await);
    assert!(runtime.get::<Node>("c1").deactivate().await);

    assert_eq!(parent.children().await.unwrap(), vec![node("c1"), node("c2")]);
    assert_eq!(runtime.get::<Node>("c1").parent().await.unwrap(), Some(node("p")));
}

#[tokio::test]
async fn test_half_registration_is_reported_and_repaired_by_retry() {
    let store = Arc::new(InMemoryEventLogStore::new());
    // the parent recorded the child, the child never recorded the parent
    store.seed(
        &node("p"),
        vec![LogEntry {
            version: 1,
            payload: serde_json::to_value(StateLogEvent::<NodeEvent>::ChildAdded { child: node("c") })
                .unwrap(),
            recorded_at: Utc::now(),
        }],
    );
    let runtime = ActivationRuntime::builder().with_log_store(store).build();
    runtime.register::<Node>();
    let parent = runtime.get::<Node>("p");

    let report = parent.validate_relationship().await.unwrap();
    assert_eq!(
        report,
        vec![RelationshipDiscrepancy::ChildParentMismatch {
            agent_id: node("p"),
            child: node("c"),
            recorded_parent: None,
        }]
    );
    assert_eq!(report[0].counterpart(), &node("c"));

    // retrying the registration writes only the missing half
    parent.register_child(&node("c")).await.unwrap();
    assert_eq!(parent.version().await.unwrap(), 1);
    assert!(parent.validate_relationship().await.unwrap().is_empty());
}
