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

//! Staging subtask: pin one file on the storage back-end and keep the pin
//! until the client releases it or the subtask ends abnormally.

use crate::context::TaskContext;
use crate::driver::{DriverCallback, DriverError, DriverOutcome, FileLocator};
use crate::error::{Error, Result};
use crate::state::{State, StatusCode};
use crate::subtask::{self, CleanupCallback, Subtask};
use crate::task::{
    RunOutcome, Schedulable, TaskCore, TaskId, TransitionEvent, TransitionObserver,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

const KIND: &str = "stage";

/// Back-end handle of an established pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinInfo {
    pub pin_id: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagePayload {
    request_id: TaskId,
    locator: FileLocator,
    pin: Option<PinInfo>,
}

/// One file of a [`StageOperation`](crate::ops::StageOperation).
///
/// `run` submits the pin and parks; the pin callback completes the subtask.
/// Whenever the subtask ends in `Canceled` or `Failed` with a pin in hand,
/// the pin is released best-effort.
pub struct StageSubtask {
    core: TaskCore,
    request_id: TaskId,
    locator: FileLocator,
    pin: Mutex<Option<PinInfo>>,
}

impl StageSubtask {
    pub fn new(
        ctx: TaskContext,
        request_id: TaskId,
        locator: FileLocator,
        lifetime: std::time::Duration,
    ) -> Arc<Self> {
        let core = TaskCore::new(ctx, KIND, lifetime);
        let this = Arc::new(Self {
            core,
            request_id,
            locator,
            pin: Mutex::new(None),
        });
        Self::wire_up(&this);
        this
    }

    /// Rebuild a staging subtask from its persisted record.
    pub fn restore(ctx: TaskContext, record: &crate::store::TaskRecord) -> Result<Arc<Self>> {
        let payload: StagePayload =
            serde_json::from_value(record.payload.clone()).map_err(Error::other)?;
        let core = TaskCore::from_record(ctx, KIND, record);
        let this = Arc::new(Self {
            core,
            request_id: payload.request_id,
            locator: payload.locator,
            pin: Mutex::new(payload.pin),
        });
        Self::wire_up(&this);
        Ok(this)
    }

    fn wire_up(this: &Arc<Self>) {
        let ctx = this.core.context();
        ctx.tasks.register(this.core.id(), this);
        this.core.add_observer(Arc::new(StageCleanup {
            subtask: Arc::downgrade(this),
        }));

        let request_id = this.request_id;
        let locator = this.locator.clone();
        let weak = Arc::downgrade(this);
        this.core.set_payload_source(move || {
            let pin = weak
                .upgrade()
                .and_then(|this| this.pin.lock().unwrap().clone());
            serde_json::to_value(StagePayload {
                request_id,
                locator: locator.clone(),
                pin,
            })
            .unwrap_or(serde_json::Value::Null)
        });
    }

    pub fn locator(&self) -> &FileLocator {
        &self.locator
    }

    pub fn pin(&self) -> Option<PinInfo> {
        self.pin.lock().unwrap().clone()
    }

    async fn submit_pin(&self) -> Result<()> {
        let cb = Arc::new(StagePinCallback {
            ctx: self.core.context().clone(),
            task_id: self.core.id(),
        });
        self.core
            .context()
            .driver
            .pin(&self.locator, Some(self.core.remaining_lifetime().await), cb)
            .await
            .map_err(|e| Error::NonFatal(e.to_string()))
    }

    fn unpin_best_effort(&self) {
        let Some(pin) = self.pin.lock().unwrap().take() else {
            return;
        };
        let ctx = self.core.context().clone();
        let task_id = self.core.id();
        tokio::spawn(async move {
            let cb = Arc::new(CleanupCallback { task_id, what: "unpin" });
            if let Err(e) = ctx.driver.unpin(&pin.file_id, &pin.pin_id, cb).await {
                warn!(task = %task_id, "could not submit unpin: {e}");
            }
        });
    }

    /// Release the pin on client request. Settles the subtask as `Released`.
    pub async fn release(&self) -> Result<()> {
        let state = self.core.state().await;
        if !state.is_final() {
            self.core
                .transition_with_status(
                    State::Done,
                    "released by client",
                    Some(StatusCode::Released),
                )
                .await?;
        } else if state == State::Done {
            self.core.set_status_code(Some(StatusCode::Released)).await;
        }
        self.unpin_best_effort();
        Ok(())
    }
}

#[async_trait]
impl Schedulable for StageSubtask {
    fn task(&self) -> &TaskCore {
        &self.core
    }

    async fn run(&self) -> Result<RunOutcome> {
        // A restored subtask may already hold its pin; do not pin twice
        if self.pin.lock().unwrap().is_some() {
            self.core
                .transition_with_status(State::Done, "file is pinned", Some(StatusCode::Success))
                .await?;
            return Ok(RunOutcome::Completed);
        }
        self.submit_pin().await?;
        Ok(RunOutcome::Pending)
    }
}

#[async_trait]
impl Subtask for StageSubtask {
    fn request_id(&self) -> TaskId {
        self.request_id
    }

    async fn status_code(&self) -> StatusCode {
        subtask::status_for(self.core.state().await, self.core.status_code().await)
    }
}

/// Continuation of the pin submitted by [`StageSubtask::run`]. Resolves the
/// subtask by id so a callback outliving its task is a logged no-op.
struct StagePinCallback {
    ctx: TaskContext,
    task_id: TaskId,
}

impl StagePinCallback {
    fn resolve(&self) -> Option<Arc<StageSubtask>> {
        match self.ctx.tasks.get::<StageSubtask>(self.task_id) {
            Ok(task) => Some(task),
            Err(_) => {
                debug!(task = %self.task_id, "dropping stale pin callback");
                None
            }
        }
    }
}

#[async_trait]
impl DriverCallback for StagePinCallback {
    async fn on_success(&self, outcome: DriverOutcome) {
        let Some(this) = self.resolve() else { return };
        // A result racing a cancel or expiry must not resurrect the subtask
        if this.core.state().await != State::InProgress {
            debug!(task = %self.task_id, "pin result arrived after the subtask moved on");
            return;
        }
        let DriverOutcome::Pinned { pin_id, file_id, size } = outcome else {
            warn!(task = %self.task_id, "unexpected driver outcome for pin");
            return;
        };
        debug!(task = %self.task_id, %pin_id, %file_id, ?size, "file pinned");
        *this.pin.lock().unwrap() = Some(PinInfo { pin_id, file_id });
        if let Err(e) = this
            .core
            .transition_with_status(State::Done, "file is pinned", Some(StatusCode::Success))
            .await
        {
            warn!(task = %self.task_id, "could not complete pinned subtask: {e}");
        }
    }

    async fn on_failure(&self, error: DriverError) {
        let Some(this) = self.resolve() else { return };
        if this.core.state().await != State::InProgress {
            return;
        }
        info!(task = %self.task_id, "pin failed: {error}");
        if let Err(e) = this
            .core
            .transition_with_status(State::Failed, &error.message, Some(error.status))
            .await
        {
            warn!(task = %self.task_id, "could not fail subtask: {e}");
        }
    }

    async fn on_timeout(&self) {
        let Some(this) = self.resolve() else { return };
        if this.core.state().await != State::InProgress {
            return;
        }
        info!(task = %self.task_id, "pin timed out, resubmitting");
        this.core.add_history_event("pin timed out, resubmitting").await;
        if let Err(e) = this.submit_pin().await {
            warn!(task = %self.task_id, "could not resubmit pin: {e}");
            let _ = this
                .core
                .transition_with_status(
                    State::Failed,
                    "pin resubmission failed",
                    Some(StatusCode::Failure),
                )
                .await;
        }
    }
}

/// Releases the pin of a subtask that ends abnormally.
struct StageCleanup {
    subtask: Weak<StageSubtask>,
}

#[async_trait]
impl TransitionObserver for StageCleanup {
    async fn on_transition(&self, event: &TransitionEvent) {
        if !matches!(event.to, State::Canceled | State::Failed) {
            return;
        }
        if let Some(this) = self.subtask.upgrade() {
            this.unpin_best_effort();
        }
    }
}
