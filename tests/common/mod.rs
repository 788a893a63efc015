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

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storsched::{
    DriverCallback, DriverError, DriverOutcome, Error, FileLocator, MemoryJobStore, Requester,
    Result, RunOutcome, Schedulable, Scheduler, SchedulerConfig, State, StatusCode, StorageDriver,
    TaskContext, TaskId,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn requester() -> Requester {
    Requester {
        user: "alice".to_string(),
        client_host: Some("client.example.org".to_string()),
    }
}

/// How the mock driver answers the next pin submission.
#[derive(Debug, Clone)]
pub enum PinBehavior {
    /// Invoke the success callback immediately.
    Succeed,
    /// Invoke the failure callback immediately.
    Fail(StatusCode, String),
    /// Keep the callback until [`MockDriver::release_held`].
    Hold,
    /// Refuse the submission itself.
    Reject,
}

/// Storage driver double. Pin submissions consume scripted behaviors
/// (defaulting to immediate success); all other calls succeed immediately.
#[derive(Default)]
pub struct MockDriver {
    pin_behaviors: Mutex<VecDeque<PinBehavior>>,
    held: Mutex<Vec<Arc<dyn DriverCallback>>>,
    unpins: Mutex<Vec<(String, String)>>,
    next_pin: AtomicU64,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_pins(&self, behaviors: impl IntoIterator<Item = PinBehavior>) {
        self.pin_behaviors.lock().unwrap().extend(behaviors);
    }

    pub fn unpins(&self) -> Vec<(String, String)> {
        self.unpins.lock().unwrap().clone()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    fn pinned_outcome(&self) -> DriverOutcome {
        let n = self.next_pin.fetch_add(1, Ordering::Relaxed);
        DriverOutcome::Pinned {
            pin_id: format!("pin-{n}"),
            file_id: format!("file-{n}"),
            size: Some(1 << 20),
        }
    }

    /// Complete every held pin submission successfully.
    pub async fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for cb in held {
            cb.on_success(self.pinned_outcome()).await;
        }
    }
}

#[async_trait]
impl StorageDriver for MockDriver {
    async fn pin(
        &self,
        _file: &FileLocator,
        _lifetime: Option<Duration>,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()> {
        let behavior = self
            .pin_behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PinBehavior::Succeed);
        match behavior {
            PinBehavior::Succeed => {
                cb.on_success(self.pinned_outcome()).await;
                Ok(())
            }
            PinBehavior::Fail(status, message) => {
                cb.on_failure(DriverError::new(status, message)).await;
                Ok(())
            }
            PinBehavior::Hold => {
                self.held.lock().unwrap().push(cb);
                Ok(())
            }
            PinBehavior::Reject => Err(Error::Driver("pin submission rejected".to_string())),
        }
    }

    async fn unpin(&self, file_id: &str, pin_id: &str, cb: Arc<dyn DriverCallback>) -> Result<()> {
        self.unpins
            .lock()
            .unwrap()
            .push((file_id.to_string(), pin_id.to_string()));
        cb.on_success(DriverOutcome::Unpinned).await;
        Ok(())
    }

    async fn prepare_put(
        &self,
        dest: &FileLocator,
        _size: Option<u64>,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()> {
        cb.on_success(DriverOutcome::PutPrepared {
            upload_url: format!("{}?upload", dest.url),
        })
        .await;
        Ok(())
    }

    async fn resolve_transfer_url(
        &self,
        file: &FileLocator,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()> {
        cb.on_success(DriverOutcome::TransferUrl {
            url: format!("{}?dl", file.url),
        })
        .await;
        Ok(())
    }

    async fn copy(
        &self,
        _source: &FileLocator,
        _dest: &FileLocator,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()> {
        cb.on_success(DriverOutcome::Copied { bytes: 1 << 20 }).await;
        Ok(())
    }
}

/// Scheduler double that runs every queued task inline, retrying non-fatal
/// failures until the retry budget is spent.
pub struct MockScheduler {
    id: String,
    epoch: u64,
    inherited: Mutex<Vec<TaskId>>,
}

impl MockScheduler {
    pub fn new(id: &str, epoch: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            epoch,
            inherited: Mutex::new(Vec::new()),
        })
    }

    pub fn inherited(&self) -> Vec<TaskId> {
        self.inherited.lock().unwrap().clone()
    }

    async fn drive(&self, task: Arc<dyn Schedulable>) -> Result<()> {
        loop {
            let core = task.task();
            match core.state().await {
                State::Unscheduled | State::Restored => {
                    core.transition(State::Queued, "queued for execution").await?;
                }
                State::Queued => {
                    core.transition(State::InProgress, "executing").await?;
                    match task.run().await {
                        Ok(RunOutcome::Completed) | Ok(RunOutcome::Pending) => return Ok(()),
                        Err(Error::NonFatal(msg)) => {
                            if core.retries_exhausted().await {
                                core.transition(State::Failed, "too many retries").await?;
                                return Ok(());
                            }
                            core.transition(State::Queued, &format!("retrying: {msg}")).await?;
                        }
                        Err(e) => {
                            core.transition(State::Failed, &e.to_string()).await?;
                            return Ok(());
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    fn id(&self) -> &str {
        &self.id
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn schedule(&self, task: Arc<dyn Schedulable>, _delay: Option<Duration>) -> Result<()> {
        self.drive(task).await
    }

    async fn queue(&self, task: Arc<dyn Schedulable>) -> Result<()> {
        self.drive(task).await
    }

    async fn try_to_ready(&self, task: Arc<dyn Schedulable>) -> Result<()> {
        let core = task.task();
        if core.state().await == State::RQueued {
            core.transition(State::Ready, "ready slot granted").await?;
        }
        Ok(())
    }

    async fn inherit(&self, task: Arc<dyn Schedulable>) {
        self.inherited.lock().unwrap().push(task.task().id());
    }
}

/// A fresh context with a mock driver, an in-memory store and one registered
/// inline scheduler.
pub struct TestEnv {
    pub ctx: TaskContext,
    pub store: Arc<MemoryJobStore>,
    pub driver: Arc<MockDriver>,
    pub scheduler: Arc<MockScheduler>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryJobStore::new());
        let driver = MockDriver::new();
        let ctx = TaskContext::new(store.clone(), driver.clone(), config);
        let scheduler = MockScheduler::new("sched-0", 1);
        ctx.schedulers.register(scheduler.clone());
        Self {
            ctx,
            store,
            driver,
            scheduler,
        }
    }
}
