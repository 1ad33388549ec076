// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Persistence Ports
//!
//! | Trait | Stores | Implementation |
//! |-------|--------|----------------|
//! | [`EventLogStore`] | Append-only per-agent log | `InMemoryEventLogStore` |
//! | [`SnapshotStore`] | Latest committed projection | `InMemorySnapshotStore` |
//!
//! Versions start at 1 for the first entry; version 0 is an empty log. The store
//! serialises appends per identity and rejects an append whose
//! `expected_version` is not the current head.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::AgentId;

/// One durable log record as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u64,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Serialised projection at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogStoreError {
    #[error("version conflict for {agent_id}: expected {expected}, log is at {actual}")]
    VersionConflict {
        agent_id: AgentId,
        expected: u64,
        actual: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for LogStoreError {
    fn from(err: serde_json::Error) -> Self {
        LogStoreError::Serialization(err.to_string())
    }
}

#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append `entries` as one contiguous segment after `expected_version`.
    /// Returns the new head version.
    async fn append(
        &self,
        agent_id: &AgentId,
        expected_version: u64,
        entries: Vec<LogEntry>,
    ) -> Result<u64, LogStoreError>;

    /// Entries with `version > after_version`, in order.
    async fn read(&self, agent_id: &AgentId, after_version: u64)
        -> Result<Vec<LogEntry>, LogStoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, agent_id: &AgentId, snapshot: Snapshot) -> Result<(), LogStoreError>;

    async fn load(&self, agent_id: &AgentId) -> Result<Option<Snapshot>, LogStoreError>;
}
