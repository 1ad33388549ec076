// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Log Engine
//!
//! Two-phase mutation of one agent's state:
//!
//! 1. [`EventLogEngine::stage`] buffers a log event and applies it to a working
//!    copy, so the rest of the turn reads its own writes.
//! 2. [`EventLogEngine::confirm`] appends the whole buffer as one segment and
//!    promotes the working copy. On failure the working copy is dropped and
//!    the committed state is untouched.
//!
//! [`EventLogEngine::replay`] rebuilds the committed state on activation from
//! the latest snapshot (if any) plus the log tail. Entries that do not decode
//! are skipped; a gap or out-of-order version aborts the replay.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::agent::Agent;
use crate::domain::error::AgentError;
use crate::domain::events::RuntimeEvent;
use crate::domain::identity::AgentId;
use crate::domain::repository::{EventLogStore, LogEntry, LogStoreError, Snapshot, SnapshotStore};
use crate::domain::state::{StateBase, StateLogEvent, Topology};
use crate::infrastructure::event_bus::RuntimeEventBus;

/// Committed topology shared read-only with the activation runtime.
pub type SharedTopology = Arc<RwLock<Topology>>;

pub struct EventLogEngine<A: Agent> {
    agent_id: AgentId,
    store: Arc<dyn EventLogStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    snapshot_interval: Option<u64>,
    bus: Option<RuntimeEventBus>,
    committed: Arc<StateBase<A::State>>,
    version: u64,
    snapshot_version: u64,
    working: Option<StateBase<A::State>>,
    pending: Vec<StateLogEvent<A::LogEvent>>,
    topology: SharedTopology,
}

impl<A: Agent> EventLogEngine<A> {
    pub fn new(agent_id: AgentId, store: Arc<dyn EventLogStore>) -> Self {
        Self {
            agent_id,
            store,
            snapshots: None,
            snapshot_interval: None,
            bus: None,
            committed: Arc::new(StateBase::default()),
            version: 0,
            snapshot_version: 0,
            working: None,
            pending: Vec::new(),
            topology: Arc::new(RwLock::new(Topology::default())),
        }
    }

    /// Snapshot every `interval` confirmed entries. `None` only reads snapshots.
    pub fn with_snapshots(mut self, store: Arc<dyn SnapshotStore>, interval: Option<u64>) -> Self {
        self.snapshots = Some(store);
        self.snapshot_interval = interval;
        self
    }

    pub fn with_event_bus(mut self, bus: RuntimeEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Committed agent state.
    pub fn state(&self) -> &A::State {
        &self.committed.state
    }

    /// Committed agent state including topology, cheap to hand out.
    pub fn committed(&self) -> Arc<StateBase<A::State>> {
        Arc::clone(&self.committed)
    }

    /// Working copy if events are staged, committed state otherwise.
    pub fn staged_state(&self) -> &A::State {
        self.working
            .as_ref()
            .map(|working| &working.state)
            .unwrap_or(&self.committed.state)
    }

    pub fn topology(&self) -> &Topology {
        &self.committed.topology
    }

    pub fn topology_handle(&self) -> SharedTopology {
        Arc::clone(&self.topology)
    }

    /// Version of the last durable entry (0 for an empty log).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rebuild the committed state from durable storage.
    pub async fn replay(&mut self) -> Result<u64, AgentError> {
        self.discard_pending();

        let mut base = StateBase::<A::State>::default();
        let mut version = 0;

        if let Some(snapshots) = &self.snapshots {
            match snapshots.load(&self.agent_id).await {
                Ok(Some(snapshot)) => {
                    match serde_json::from_value::<StateBase<A::State>>(snapshot.state) {
                        Ok(state) => {
                            base = state;
                            version = snapshot.version;
                        }
                        Err(e) => warn!(
                            agent_id = %self.agent_id,
                            version = snapshot.version,
                            error = %e,
                            "Snapshot does not decode, replaying full log"
                        ),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "Snapshot store unavailable, replaying full log"
                ),
            }
        }
        let snapshot_version = version;

        let entries = self
            .store
            .read(&self.agent_id, version)
            .await
            .map_err(|source| AgentError::LogRead {
                agent_id: self.agent_id.clone(),
                source,
            })?;

        let mut skipped = 0u64;
        for entry in &entries {
            let expected = version + 1;
            if entry.version != expected {
                metrics::counter!("canopy_log_corruptions_total").increment(1);
                return Err(AgentError::LogCorruption {
                    agent_id: self.agent_id.clone(),
                    expected,
                    found: entry.version,
                });
            }
            match serde_json::from_value::<StateLogEvent<A::LogEvent>>(entry.payload.clone()) {
                Ok(event) => base.apply(&event, A::transition),
                Err(e) => {
                    skipped += 1;
                    debug!(
                        agent_id = %self.agent_id,
                        version = entry.version,
                        error = %e,
                        "Skipping unknown log event"
                    );
                }
            }
            version = entry.version;
        }

        metrics::counter!("canopy_log_entries_replayed_total").increment(entries.len() as u64);
        if skipped > 0 {
            metrics::counter!("canopy_log_entries_skipped_total").increment(skipped);
            warn!(agent_id = %self.agent_id, skipped, "Replay skipped unknown log events");
        }

        self.committed = Arc::new(base);
        self.version = version;
        self.snapshot_version = snapshot_version;
        self.publish_topology();

        info!(
            agent_id = %self.agent_id,
            version,
            from_snapshot = snapshot_version,
            replayed = entries.len(),
            "Replayed event log"
        );
        Ok(version)
    }

    /// Buffer `event` and apply it to the working copy.
    pub fn stage(&mut self, event: StateLogEvent<A::LogEvent>) {
        let committed = &self.committed;
        let working = self
            .working
            .get_or_insert_with(|| (**committed).clone());
        working.apply(&event, A::transition);
        self.pending.push(event);
    }

    /// Persist every staged event as one segment and promote the working copy.
    ///
    /// A no-op when nothing is staged. Returns the new version.
    pub async fn confirm(&mut self) -> Result<u64, AgentError> {
        if self.pending.is_empty() {
            return Ok(self.version);
        }

        let count = self.pending.len();
        let recorded_at = Utc::now();
        let entries: Result<Vec<LogEntry>, serde_json::Error> = self
            .pending
            .iter()
            .zip(self.version + 1..)
            .map(|(event, version)| {
                Ok(LogEntry {
                    version,
                    payload: serde_json::to_value(event)?,
                    recorded_at,
                })
            })
            .collect();
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => return Err(self.fail_confirm(count, LogStoreError::from(e))),
        };

        let version = match self.store.append(&self.agent_id, self.version, entries).await {
            Ok(version) => version,
            Err(source) => return Err(self.fail_confirm(count, source)),
        };

        if let Some(working) = self.working.take() {
            self.committed = Arc::new(working);
        }
        self.pending.clear();
        self.version = version;
        self.publish_topology();

        metrics::counter!("canopy_confirms_total").increment(1);
        metrics::counter!("canopy_events_confirmed_total").increment(count as u64);
        debug!(agent_id = %self.agent_id, version, count, "Confirmed staged events");

        if let Some(bus) = &self.bus {
            bus.publish(RuntimeEvent::StateConfirmed {
                agent_id: self.agent_id.clone(),
                version,
                event_count: count,
                confirmed_at: recorded_at,
            });
        }

        self.maybe_snapshot().await;
        Ok(version)
    }

    /// Drop staged events and the working copy. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.working = None;
        dropped
    }

    fn fail_confirm(&mut self, count: usize, source: LogStoreError) -> AgentError {
        self.discard_pending();
        metrics::counter!("canopy_persistence_failures_total").increment(1);
        warn!(
            agent_id = %self.agent_id,
            version = self.version,
            count,
            error = %source,
            "Confirm failed, staged events discarded"
        );
        AgentError::PersistenceFailure {
            agent_id: self.agent_id.clone(),
            count,
            source,
        }
    }

    async fn maybe_snapshot(&mut self) {
        let (Some(store), Some(interval)) = (self.snapshots.clone(), self.snapshot_interval) else {
            return;
        };
        if self.version - self.snapshot_version < interval {
            return;
        }

        let state = match serde_json::to_value(&*self.committed) {
            Ok(state) => state,
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to encode snapshot");
                return;
            }
        };
        let snapshot = Snapshot {
            version: self.version,
            state,
            taken_at: Utc::now(),
        };
        match store.save(&self.agent_id, snapshot).await {
            Ok(()) => {
                self.snapshot_version = self.version;
                debug!(agent_id = %self.agent_id, version = self.version, "Snapshot saved");
            }
            // the log stays authoritative; retry at the next confirm
            Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Failed to save snapshot"),
        }
    }

    fn publish_topology(&self) {
        let committed = &self.committed.topology;
        let mut shared = self.topology.write();
        if *shared != *committed {
            *shared = committed.clone();
        }
    }
}
