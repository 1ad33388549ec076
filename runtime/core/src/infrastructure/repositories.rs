// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! In-memory implementations of the persistence ports defined in
//! [`crate::domain::repository`].
//!
//! - **InMemoryEventLogStore** - per-agent append-only log with an expected-version check
//! - **InMemorySnapshotStore** - latest snapshot per agent
//!
//! Both are cheap to clone and share one backing map, so a test can keep a
//! handle while the runtime owns another.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::identity::AgentId;
use crate::domain::repository::{EventLogStore, LogEntry, LogStoreError, Snapshot, SnapshotStore};

#[derive(Clone, Default)]
pub struct InMemoryEventLogStore {
    logs: Arc<RwLock<HashMap<AgentId, Vec<LogEntry>>>>,
}

impl InMemoryEventLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current head version of `agent_id` (0 for an empty log).
    pub fn head(&self, agent_id: &AgentId) -> u64 {
        self.logs
            .read()
            .get(agent_id)
            .and_then(|log| log.last())
            .map(|entry| entry.version)
            .unwrap_or(0)
    }

    /// All entries of `agent_id`.
    pub fn entries(&self, agent_id: &AgentId) -> Vec<LogEntry> {
        self.logs.read().get(agent_id).cloned().unwrap_or_default()
    }

    /// Write raw entries without any version check. Used to import logs and
    /// to reproduce damaged ones.
    pub fn seed(&self, agent_id: &AgentId, entries: Vec<LogEntry>) {
        self.logs
            .write()
            .entry(agent_id.clone())
            .or_default()
            .extend(entries);
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLogStore {
    async fn append(
        &self,
        agent_id: &AgentId,
        expected_version: u64,
        entries: Vec<LogEntry>,
    ) -> Result<u64, LogStoreError> {
        let mut logs = self.logs.write();
        let log = logs.entry(agent_id.clone()).or_default();
        let actual = log.last().map(|entry| entry.version).unwrap_or(0);
        if actual != expected_version {
            return Err(LogStoreError::VersionConflict {
                agent_id: agent_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        log.extend(entries);
        Ok(log.last().map(|entry| entry.version).unwrap_or(0))
    }

    async fn read(
        &self,
        agent_id: &AgentId,
        after_version: u64,
    ) -> Result<Vec<LogEntry>, LogStoreError> {
        let logs = self.logs.read();
        Ok(logs
            .get(agent_id)
            .map(|log| {
                log.iter()
                    .filter(|entry| entry.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<AgentId, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, agent_id: &AgentId) -> Option<Snapshot> {
        self.snapshots.read().get(agent_id).cloned()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, agent_id: &AgentId, snapshot: Snapshot) -> Result<(), LogStoreError> {
        let mut snapshots = self.snapshots.write();
        // never move a snapshot backwards
        let newer = snapshots
            .get(agent_id)
            .map_or(true, |current| current.version < snapshot.version);
        if newer {
            snapshots.insert(agent_id.clone(), snapshot);
        }
        Ok(())
    }

    async fn load(&self, agent_id: &AgentId) -> Result<Option<Snapshot>, LogStoreError> {
        Ok(self.latest(agent_id))
    }
}
