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

//! Fetch subtask: pin one file, resolve a client-usable transfer URL, and
//! hold the file `Ready` until the client completes its transfer.
//!
//! Lifecycle after the pin: `InProgress` while pinning and resolving the
//! URL, `RQueued` once the URL is known, `Ready` when the scheduler grants a
//! ready slot, `Transferring` while the client moves data, then `Done`. The
//! pin is released whenever the subtask reaches any terminal state.

use crate::context::TaskContext;
use crate::driver::{DriverCallback, DriverError, DriverOutcome, FileLocator};
use crate::error::{Error, Result};
use crate::ops::stage::PinInfo;
use crate::state::{State, StatusCode};
use crate::subtask::{self, CleanupCallback, Subtask};
use crate::task::{
    RunOutcome, Schedulable, TaskCore, TaskId, TransitionEvent, TransitionObserver,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

const KIND: &str = "fetch";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchPayload {
    request_id: TaskId,
    locator: FileLocator,
    pin: Option<PinInfo>,
    transfer_url: Option<String>,
}

/// One file of a [`FetchOperation`](crate::ops::FetchOperation).
pub struct FetchSubtask {
    core: TaskCore,
    request_id: TaskId,
    locator: FileLocator,
    pin: Mutex<Option<PinInfo>>,
    transfer_url: Mutex<Option<String>>,
}

impl FetchSubtask {
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
            transfer_url: Mutex::new(None),
        });
        Self::wire_up(&this);
        this
    }

    pub fn restore(ctx: TaskContext, record: &crate::store::TaskRecord) -> Result<Arc<Self>> {
        let payload: FetchPayload =
            serde_json::from_value(record.payload.clone()).map_err(Error::other)?;
        let core = TaskCore::from_record(ctx, KIND, record);
        let this = Arc::new(Self {
            core,
            request_id: payload.request_id,
            locator: payload.locator,
            pin: Mutex::new(payload.pin),
            transfer_url: Mutex::new(payload.transfer_url),
        });
        Self::wire_up(&this);
        Ok(this)
    }

    fn wire_up(this: &Arc<Self>) {
        let ctx = this.core.context();
        ctx.tasks.register(this.core.id(), this);
        this.core.add_observer(Arc::new(FetchCleanup {
            subtask: Arc::downgrade(this),
        }));

        let request_id = this.request_id;
        let locator = this.locator.clone();
        let weak = Arc::downgrade(this);
        this.core.set_payload_source(move || {
            let (pin, transfer_url) = match weak.upgrade() {
                Some(this) => (
                    this.pin.lock().unwrap().clone(),
                    this.transfer_url.lock().unwrap().clone(),
                ),
                None => (None, None),
            };
            serde_json::to_value(FetchPayload {
                request_id,
                locator: locator.clone(),
                pin,
                transfer_url,
            })
            .unwrap_or(serde_json::Value::Null)
        });
    }

    pub fn locator(&self) -> &FileLocator {
        &self.locator
    }

    pub fn transfer_url(&self) -> Option<String> {
        self.transfer_url.lock().unwrap().clone()
    }

    async fn submit_pin(&self) -> Result<()> {
        let cb = Arc::new(FetchPinCallback {
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

    async fn submit_resolve(&self) -> Result<()> {
        let cb = Arc::new(FetchUrlCallback {
            ctx: self.core.context().clone(),
            task_id: self.core.id(),
        });
        self.core
            .context()
            .driver
            .resolve_transfer_url(&self.locator, cb)
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

    /// The client opened the transfer URL and started moving data.
    pub async fn mark_transferring(&self) -> Result<()> {
        self.core
            .transition(State::Transferring, "client started transfer")
            .await
    }

    /// The client finished its transfer.
    pub async fn transfer_done(&self) -> Result<()> {
        self.core
            .transition_with_status(State::Done, "transfer complete", Some(StatusCode::Success))
            .await
    }

    /// Give up the file on client request before or after the transfer.
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
            self.unpin_best_effort();
        }
        Ok(())
    }
}

#[async_trait]
impl Schedulable for FetchSubtask {
    fn task(&self) -> &TaskCore {
        &self.core
    }

    async fn run(&self) -> Result<RunOutcome> {
        // A restored subtask may already hold its pin or even its URL;
        // resume from wherever the callbacks last left it
        if self.pin.lock().unwrap().is_some() {
            if self.transfer_url.lock().unwrap().is_some() {
                self.core
                    .transition(State::RQueued, "transfer URL resolved")
                    .await?;
                let this = self
                    .core
                    .context()
                    .tasks
                    .get::<FetchSubtask>(self.core.id())?;
                subtask::try_to_ready(this as Arc<dyn Schedulable>).await?;
                return Ok(RunOutcome::Completed);
            }
            self.submit_resolve().await?;
            return Ok(RunOutcome::Pending);
        }
        self.submit_pin().await?;
        Ok(RunOutcome::Pending)
    }
}

#[async_trait]
impl Subtask for FetchSubtask {
    fn request_id(&self) -> TaskId {
        self.request_id
    }

    async fn status_code(&self) -> StatusCode {
        subtask::status_for(self.core.state().await, self.core.status_code().await)
    }
}

struct FetchPinCallback {
    ctx: TaskContext,
    task_id: TaskId,
}

impl FetchPinCallback {
    fn resolve(&self) -> Option<Arc<FetchSubtask>> {
        match self.ctx.tasks.get::<FetchSubtask>(self.task_id) {
            Ok(task) => Some(task),
            Err(_) => {
                debug!(task = %self.task_id, "dropping stale pin callback");
                None
            }
        }
    }
}

#[async_trait]
impl DriverCallback for FetchPinCallback {
    async fn on_success(&self, outcome: DriverOutcome) {
        let Some(this) = self.resolve() else { return };
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
        this.core.add_history_event("file pinned, resolving transfer URL").await;
        if let Err(e) = this.submit_resolve().await {
            warn!(task = %self.task_id, "could not resolve transfer URL: {e}");
            let _ = this
                .core
                .transition_with_status(
                    State::Failed,
                    "transfer URL resolution failed",
                    Some(StatusCode::Failure),
                )
                .await;
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

struct FetchUrlCallback {
    ctx: TaskContext,
    task_id: TaskId,
}

#[async_trait]
impl DriverCallback for FetchUrlCallback {
    async fn on_success(&self, outcome: DriverOutcome) {
        let this = match self.ctx.tasks.get::<FetchSubtask>(self.task_id) {
            Ok(task) => task,
            Err(_) => {
                debug!(task = %self.task_id, "dropping stale transfer URL callback");
                return;
            }
        };
        if this.core.state().await != State::InProgress {
            return;
        }
        let DriverOutcome::TransferUrl { url } = outcome else {
            warn!(task = %self.task_id, "unexpected driver outcome for transfer URL");
            return;
        };
        *this.transfer_url.lock().unwrap() = Some(url);
        if let Err(e) = this
            .core
            .transition(State::RQueued, "transfer URL resolved")
            .await
        {
            warn!(task = %self.task_id, "could not queue subtask for ready pool: {e}");
            return;
        }
        if let Err(e) = subtask::try_to_ready(this.clone() as Arc<dyn Schedulable>).await {
            warn!(task = %self.task_id, "could not promote subtask: {e}");
        }
    }

    async fn on_failure(&self, error: DriverError) {
        let Ok(this) = self.ctx.tasks.get::<FetchSubtask>(self.task_id) else {
            return;
        };
        if this.core.state().await != State::InProgress {
            return;
        }
        info!(task = %self.task_id, "transfer URL resolution failed: {error}");
        let _ = this
            .core
            .transition_with_status(State::Failed, &error.message, Some(error.status))
            .await;
    }

    async fn on_timeout(&self) {
        let Ok(this) = self.ctx.tasks.get::<FetchSubtask>(self.task_id) else {
            return;
        };
        if this.core.state().await != State::InProgress {
            return;
        }
        info!(task = %self.task_id, "transfer URL resolution timed out, resubmitting");
        if let Err(e) = this.submit_resolve().await {
            warn!(task = %self.task_id, "could not resubmit resolution: {e}");
            let _ = this
                .core
                .transition_with_status(
                    State::Failed,
                    "transfer URL resolution failed",
                    Some(StatusCode::Failure),
                )
                .await;
        }
    }
}

/// Releases the pin once the subtask settles, whatever the outcome.
struct FetchCleanup {
    subtask: Weak<FetchSubtask>,
}

#[async_trait]
impl TransitionObserver for FetchCleanup {
    async fn on_transition(&self, event: &TransitionEvent) {
        if !event.to.is_final() {
            return;
        }
        if let Some(this) = self.subtask.upgrade() {
            this.unpin_best_effort();
        }
    }
}
