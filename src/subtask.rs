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

//! Per-file units of work inside a composite operation.

use crate::driver::{DriverCallback, DriverError, DriverOutcome};
use crate::error::Result;
use crate::state::{State, StatusCode};
use crate::task::{Schedulable, TaskId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// One file-scoped unit of a composite operation.
#[async_trait]
pub trait Subtask: Schedulable {
    /// Id of the composite operation this subtask belongs to.
    fn request_id(&self) -> TaskId;

    /// Protocol status of this subtask, derived from its lifecycle state and
    /// recorded failure code.
    async fn status_code(&self) -> StatusCode;

    /// Abort this subtask. Terminal subtasks are left alone by callers; the
    /// default cancels and records `Aborted`.
    async fn abort(&self, reason: &str) -> Result<()> {
        self.task()
            .transition_with_status(State::Canceled, reason, Some(StatusCode::Aborted))
            .await
    }
}

/// Default mapping from a subtask's lifecycle state to its protocol status.
/// An explicitly recorded status (failure code, release) wins.
pub fn status_for(state: State, recorded: Option<StatusCode>) -> StatusCode {
    if let Some(code) = recorded {
        return code;
    }
    match state {
        State::Unscheduled | State::Restored | State::Queued => StatusCode::Queued,
        State::InProgress | State::RQueued => StatusCode::InProgress,
        State::Ready | State::Transferring => StatusCode::Ready,
        State::Done => StatusCode::Success,
        State::Failed => StatusCode::Failure,
        State::Canceled => StatusCode::Aborted,
    }
}

/// Ask the affiliated scheduler to promote a subtask waiting for a ready
/// slot. A no-op unless the subtask is in `RQueued`.
pub async fn try_to_ready(subtask: Arc<dyn Schedulable>) -> Result<()> {
    let core = subtask.task();
    if core.state().await != State::RQueued {
        return Ok(());
    }
    let Some(affiliation) = core.scheduler().await else {
        return Ok(());
    };
    match core.context().schedulers.get(&affiliation.id) {
        Some(scheduler) => scheduler.try_to_ready(subtask.clone()).await,
        None => {
            warn!(task = %core.id(), scheduler = %affiliation.id, "affiliated scheduler is not registered");
            Ok(())
        }
    }
}

/// Callback for best-effort cleanup calls (releasing pins of canceled or
/// failed subtasks). Outcomes are only logged.
pub struct CleanupCallback {
    pub task_id: TaskId,
    pub what: &'static str,
}

#[async_trait]
impl DriverCallback for CleanupCallback {
    async fn on_success(&self, _outcome: DriverOutcome) {
        debug!(task = %self.task_id, "{} cleanup succeeded", self.what);
    }

    async fn on_failure(&self, error: DriverError) {
        warn!(task = %self.task_id, "{} cleanup failed: {error}", self.what);
    }

    async fn on_timeout(&self) {
        warn!(task = %self.task_id, "{} cleanup timed out", self.what);
    }
}
