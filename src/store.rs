// Copyright 2024 StorSched Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Best-effort persistence of task snapshots.
//!
//! Stores receive full records on every save; the in-memory task is always
//! authoritative, and save failures are logged by the caller rather than
//! propagated into transitions.

use crate::error::Result;
use crate::state::{State, StatusCode};
use crate::task::{HistoryEvent, SchedulerAffiliation, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Persistable snapshot of a task.
///
/// `payload` carries the variant-specific fields (file locator, pin id,
/// transfer URL) as provided by the task's payload source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: String,
    pub state: State,
    pub created_at: SystemTime,
    pub lifetime: Duration,
    pub scheduler: Option<SchedulerAffiliation>,
    pub status_code: Option<StatusCode>,
    pub retries: u32,
    pub history: Vec<HistoryEvent>,
    pub payload: serde_json::Value,
}

/// Persistent store for task records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Save a snapshot. `force` requests an unconditional write; stores may
    /// otherwise coalesce or skip saves of transient states.
    async fn save(&self, record: &TaskRecord, force: bool) -> Result<()>;

    async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Ids of every stored record, for restart recovery sweeps.
    async fn ids(&self) -> Result<Vec<TaskId>>;
}

/// In-memory [`JobStore`], used in tests and as the fallback when no durable
/// store is configured.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    saves: RwLock<u64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save calls that reached the store.
    pub async fn save_count(&self) -> u64 {
        *self.saves.read().await
    }

    /// Seed a record directly, bypassing the save counter.
    pub async fn insert(&self, record: TaskRecord) {
        self.records.write().await.insert(record.id, record);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, record: &TaskRecord, _force: bool) -> Result<()> {
        *self.saves.write().await += 1;
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn ids(&self) -> Result<Vec<TaskId>> {
        Ok(self.records.read().await.keys().copied().collect())
    }
}
