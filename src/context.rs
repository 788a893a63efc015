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

//! Shared service context handed to every task at construction.
//!
//! Tasks never reach for globals; the context carries the store, the storage
//! driver, the scheduler registry, the live-task registry and the id
//! generator. Cloning is cheap, every field is an `Arc`.

use crate::config::SchedulerConfig;
use crate::driver::StorageDriver;
use crate::error::{Error, Result};
use crate::sched::Scheduler;
use crate::store::JobStore;
use crate::task::TaskId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generator of process-unique, roughly time-ordered ids for tasks and
/// history events.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            // Seed from wall time so ids do not collide with records from a
            // previous incarnation.
            next: AtomicU64::new(millis << 16),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live tasks, used by driver callbacks to resolve a task id back
/// into a typed handle.
///
/// Holds weak references only: a task dropped elsewhere simply stops
/// resolving, and stale callbacks land on [`Error::TaskNotFound`].
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Weak<dyn Any + Send + Sync>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + Sync + 'static>(&self, id: TaskId, task: &Arc<T>) {
        let task: Arc<dyn Any + Send + Sync> = task.clone();
        self.tasks.write().unwrap().insert(id, Arc::downgrade(&task));
    }

    /// Resolve an id to a live task of type `T`. Fails if the task is gone
    /// or of a different type.
    pub fn get<T: Send + Sync + 'static>(&self, id: TaskId) -> Result<Arc<T>> {
        let weak = self
            .tasks
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))?;
        let any = weak.upgrade().ok_or(Error::TaskNotFound(id))?;
        any.downcast::<T>().map_err(|_| Error::TaskNotFound(id))
    }

    pub fn remove(&self, id: TaskId) {
        self.tasks.write().unwrap().remove(&id);
    }

    /// Drop entries whose tasks are gone.
    pub fn prune(&self) {
        self.tasks
            .write()
            .unwrap()
            .retain(|_, weak| weak.strong_count() > 0);
    }
}

/// Registry of scheduler instances by id, consulted when a task needs to call
/// back into its affiliated scheduler.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, Arc<dyn Scheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheduler: Arc<dyn Scheduler>) {
        self.schedulers
            .write()
            .unwrap()
            .insert(scheduler.id().to_string(), scheduler);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.read().unwrap().get(id).cloned()
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.schedulers.read().unwrap().keys().cloned().collect();
        f.debug_struct("SchedulerRegistry").field("ids", &ids).finish()
    }
}

/// Everything a task needs from its environment.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub store: Arc<dyn JobStore>,
    pub driver: Arc<dyn StorageDriver>,
    pub schedulers: Arc<SchedulerRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub ids: Arc<IdGenerator>,
    pub config: Arc<SchedulerConfig>,
}

impl TaskContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        driver: Arc<dyn StorageDriver>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            driver,
            schedulers: Arc::new(SchedulerRegistry::new()),
            tasks: Arc::new(TaskRegistry::new()),
            ids: Arc::new(IdGenerator::new()),
            config: Arc::new(config),
        }
    }
}

impl std::fmt::Debug for dyn JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JobStore")
    }
}

impl std::fmt::Debug for dyn StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageDriver")
    }
}
