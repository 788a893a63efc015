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

//! Multi-file operations: a parent task fanning out into per-file subtasks,
//! with quantitative status aggregation and change-driven long polling.
//!
//! Aggregation is lazy. Children never touch the parent's lock when they
//! transition; they only bump the change counter, and the parent recomputes
//! its view on the next status query. This keeps the lock order strictly
//! parent-then-child and rules out the deadlock of a child notifying upward
//! while a status query walks downward.

use crate::error::{Error, Result};
use crate::operation::{OperationCore, Requester};
use crate::sched::Scheduler;
use crate::state::{State, StatusCode};
use crate::subtask::{self, Subtask};
use crate::task::{
    RunOutcome, Schedulable, TaskCore, TaskId, TransitionEvent, TransitionObserver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Monotonic counter of client-visible subtask changes, shared between a
/// composite operation and its children.
///
/// Built on a watch channel so waiters never miss an increment that lands
/// between reading the counter and going to sleep.
#[derive(Clone, Debug)]
pub struct ChangeCounter {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeCounter {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(0).0),
        }
    }

    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn increment(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    /// Wait until the counter exceeds `seen` or the deadline passes.
    /// Returns false on deadline.
    pub async fn await_change(&self, seen: u64, deadline: Instant) -> bool {
        let mut rx = self.tx.subscribe();
        let changed = matches!(
            timeout_at(deadline, rx.wait_for(|v| *v > seen)).await,
            Ok(Ok(_))
        );
        changed
    }
}

impl Default for ChangeCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer installed on every child: bump the counter on transitions a
/// polling client can observe. Takes no task locks.
struct ChildWatch {
    counter: ChangeCounter,
}

#[async_trait]
impl TransitionObserver for ChildWatch {
    async fn on_transition(&self, event: &TransitionEvent) {
        if matches!(
            event.to,
            State::RQueued | State::Ready | State::Done | State::Canceled | State::Failed
        ) {
            self.counter.increment();
        }
    }
}

/// Result of aborting a composite operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// At least one subtask was aborted, or there was nothing left to abort.
    Success,
    /// Every abort attempt failed.
    Failure,
}

/// Point-in-time view of a composite operation for monitoring surfaces.
#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub status: StatusCode,
    pub total: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub subtask_statuses: Vec<(TaskId, StatusCode)>,
}

/// A client operation spanning several files.
pub struct CompositeOperation<S: Subtask> {
    op: OperationCore,
    children: Vec<Arc<S>>,
    counter: ChangeCounter,
}

impl<S: Subtask> CompositeOperation<S> {
    /// Create a composite operation, building its children through
    /// `make_children` so they can carry the parent id from birth.
    #[allow(clippy::too_many_arguments)]
    pub fn new<F>(
        ctx: crate::context::TaskContext,
        kind: &'static str,
        requester: Requester,
        credential_id: Option<u64>,
        description: Option<String>,
        lifetime: Option<Duration>,
        make_children: F,
    ) -> Arc<Self>
    where
        F: FnOnce(TaskId) -> Vec<Arc<S>>,
    {
        let op = OperationCore::new(ctx, kind, requester, credential_id, description, lifetime);
        let id = op.id();
        let children = make_children(id);
        let this = Arc::new(Self {
            op,
            children,
            counter: ChangeCounter::new(),
        });
        Self::wire_up(&this);
        info!(task = %id, kind, subtasks = this.children.len(), "operation created");
        this
    }

    /// Rebuild a composite operation from its persisted record and already
    /// restored children.
    pub fn restore(
        task: TaskCore,
        requester: Requester,
        credential_id: Option<u64>,
        description: Option<String>,
        children: Vec<Arc<S>>,
    ) -> Arc<Self> {
        let op = OperationCore::from_parts(task, requester, credential_id, description);
        let this = Arc::new(Self {
            op,
            children,
            counter: ChangeCounter::new(),
        });
        Self::wire_up(&this);
        this
    }

    fn wire_up(this: &Arc<Self>) {
        for child in &this.children {
            child.task().add_observer(Arc::new(ChildWatch {
                counter: this.counter.clone(),
            }));
        }
        let ctx = this.op.task().context();
        ctx.tasks.register(this.op.id(), this);

        let requester = this.op.requester().clone();
        let credential_id = this.op.credential_id();
        let description = this.op.description().map(str::to_string);
        let child_ids: Vec<TaskId> = this.children.iter().map(|c| c.task().id()).collect();
        this.op.task().set_payload_source(move || {
            serde_json::json!({
                "requester": requester,
                "credential_id": credential_id,
                "description": description,
                "children": child_ids,
            })
        });
    }

    pub fn core(&self) -> &OperationCore {
        &self.op
    }

    pub fn id(&self) -> TaskId {
        self.op.id()
    }

    pub fn children(&self) -> &[Arc<S>] {
        &self.children
    }

    pub fn change_counter(&self) -> &ChangeCounter {
        &self.counter
    }

    /// Hand the operation to a scheduler. Only legal while unscheduled.
    pub async fn schedule(&self, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        let state = self.op.task().state().await;
        if state != State::Unscheduled {
            return Err(Error::IllegalStateTransition {
                from: state,
                to: State::Queued,
            });
        }
        self.op
            .task()
            .set_scheduler(scheduler.id(), scheduler.epoch())
            .await;
        let this = self.op.task().context().tasks.get::<Self>(self.op.id())?;
        scheduler.schedule(this as Arc<dyn Schedulable>, None).await
    }

    /// Derive the parent's own lifecycle state from the children.
    ///
    /// A no-op while any child is non-final; once all children settled the
    /// operation ends in `Done` or `Failed` and the poll delay freezes.
    pub async fn refresh_state(&self) {
        let state = self.op.task().state().await;
        if state.is_final() {
            return;
        }
        if self.children.is_empty() {
            error!(task = %self.op.id(), "operation has no subtasks");
            if let Err(e) = self
                .op
                .task()
                .transition_with_status(
                    State::Failed,
                    "operation contains no subtasks",
                    Some(StatusCode::InternalError),
                )
                .await
            {
                warn!(task = %self.op.id(), "could not fail empty operation: {e}");
            }
            return;
        }

        let mut have_failed = false;
        for child in &self.children {
            let child_state = child.task().state().await;
            if !child_state.is_final() {
                return;
            }
            if child_state != State::Done {
                have_failed = true;
            }
        }

        self.op.freeze_poll_delay().await;
        let result = if have_failed {
            self.op
                .task()
                .transition(State::Failed, "subtasks have failed")
                .await
        } else {
            self.op
                .task()
                .transition(State::Done, "all subtasks succeeded")
                .await
        };
        if let Err(e) = result {
            warn!(task = %self.op.id(), "could not settle operation: {e}");
        }
    }

    /// Compute the aggregate protocol status from the children's statuses.
    ///
    /// An explicitly recorded status (abort, expiration, internal failure)
    /// takes precedence over any aggregation.
    pub async fn aggregate_status(&self) -> StatusCode {
        self.refresh_state().await;
        if let Some(code) = self.op.task().status_code().await {
            return code;
        }
        let total = self.children.len();
        if total == 0 {
            return StatusCode::InternalError;
        }

        let mut queued = 0usize;
        let mut running = 0usize;
        let mut ready = 0usize;
        let mut done = 0usize;
        let mut canceled = 0usize;
        let mut failed = 0usize;
        let mut no_space = 0usize;
        let mut space_expired = 0usize;

        // Canceled children form their own class: they never count toward
        // the all-failed check, only toward the final mixed-outcome fold.
        for child in &self.children {
            match child.status_code().await {
                StatusCode::Queued => queued += 1,
                StatusCode::InProgress => running += 1,
                StatusCode::Ready => ready += 1,
                StatusCode::Success | StatusCode::Released => done += 1,
                StatusCode::Aborted => canceled += 1,
                StatusCode::NoFreeSpace => {
                    no_space += 1;
                    failed += 1;
                }
                StatusCode::SpaceLifetimeExpired => {
                    space_expired += 1;
                    failed += 1;
                }
                code if code.is_failure() => failed += 1,
                code => {
                    warn!(task = %self.op.id(), child = %child.task().id(), %code,
                        "unexpected subtask status");
                    return StatusCode::InternalError;
                }
            }
        }

        if canceled == total {
            StatusCode::Aborted
        } else if failed == total {
            StatusCode::Failure
        } else if queued == total {
            StatusCode::Queued
        } else if no_space > 0 {
            StatusCode::NoFreeSpace
        } else if space_expired > 0 {
            StatusCode::SpaceLifetimeExpired
        } else if queued > 0 || running > 0 {
            StatusCode::InProgress
        } else if failed > 0 || canceled > 0 {
            if done + ready > 0 {
                StatusCode::PartialSuccess
            } else {
                StatusCode::Failure
            }
        } else {
            StatusCode::Success
        }
    }

    /// Long-poll the aggregate status: return as soon as it leaves the
    /// processing states, or with the current status once `timeout` elapses.
    pub async fn status_within(&self, timeout: Duration) -> StatusCode {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.counter.get();
            let status = self.aggregate_status().await;
            if !status.is_processing() {
                return status;
            }
            if !self.counter.await_change(seen, deadline).await {
                return self.aggregate_status().await;
            }
        }
    }

    /// Point-in-time summary for monitoring.
    pub async fn summary(&self) -> OperationSummary {
        let status = self.aggregate_status().await;
        let mut subtask_statuses = Vec::with_capacity(self.children.len());
        let mut waiting = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        for child in &self.children {
            let code = child.status_code().await;
            match code {
                StatusCode::Success | StatusCode::Released => completed += 1,
                code if code.is_failure() => failed += 1,
                _ => waiting += 1,
            }
            subtask_statuses.push((child.task().id(), code));
        }
        OperationSummary {
            status,
            total: self.children.len(),
            waiting,
            completed,
            failed,
            subtask_statuses,
        }
    }

    /// Abort the operation and every non-terminal subtask.
    ///
    /// Aborting an already-settled operation reports success without touching
    /// anything. A partial failure still reports success as long as one
    /// subtask was actually aborted.
    pub async fn abort(&self, reason: &str) -> AbortOutcome {
        self.refresh_state().await;
        let state = self.op.task().state().await;
        if state.is_final() {
            return AbortOutcome::Success;
        }
        if let Err(e) = self
            .op
            .task()
            .transition_with_status(State::Canceled, reason, Some(StatusCode::Aborted))
            .await
        {
            warn!(task = %self.op.id(), "could not cancel operation: {e}");
        }

        let mut attempted = false;
        let mut has_success = false;
        let mut has_failure = false;
        for child in &self.children {
            if child.task().state().await.is_final() {
                continue;
            }
            attempted = true;
            match child.abort(reason).await {
                Ok(()) => has_success = true,
                Err(e) => {
                    warn!(task = %self.op.id(), child = %child.task().id(), "abort failed: {e}");
                    has_failure = true;
                }
            }
        }

        if !attempted || has_success || !has_failure {
            AbortOutcome::Success
        } else {
            AbortOutcome::Failure
        }
    }

    /// Expire the operation if its lifetime elapsed, cascading a forced
    /// failure into every non-terminal subtask first. Returns true if
    /// expired.
    pub async fn check_expiration(&self) -> bool {
        if self.op.task().state().await.is_final() || !self.op.task().is_expired().await {
            return false;
        }
        for child in &self.children {
            if child.task().state().await.is_final() {
                continue;
            }
            if let Err(e) = child
                .task()
                .transition_with_status(
                    State::Failed,
                    "lifetime expired",
                    Some(StatusCode::RequestTimedOut),
                )
                .await
            {
                warn!(task = %self.op.id(), child = %child.task().id(),
                    "could not expire subtask: {e}");
            }
        }
        self.op.check_expiration().await
    }

    /// Offer every subtask waiting for a ready slot to its scheduler.
    pub async fn try_to_ready(&self) {
        for child in &self.children {
            if let Err(e) = subtask::try_to_ready(child.clone() as Arc<dyn Schedulable>).await {
                warn!(task = %self.op.id(), child = %child.task().id(),
                    "could not promote subtask: {e}");
            }
        }
    }
}

#[async_trait]
impl<S: Subtask> Schedulable for CompositeOperation<S> {
    fn task(&self) -> &TaskCore {
        self.op.task()
    }

    /// Running a composite operation means scheduling its children; the
    /// parent then parks until [`CompositeOperation::refresh_state`] settles
    /// it.
    async fn run(&self) -> Result<RunOutcome> {
        let affiliation = self
            .op
            .task()
            .scheduler()
            .await
            .ok_or_else(|| Error::Fatal("operation has no scheduler affiliation".to_string()))?;
        let scheduler = self
            .op
            .task()
            .context()
            .schedulers
            .get(&affiliation.id)
            .ok_or_else(|| {
                Error::Fatal(format!("scheduler {} is not registered", affiliation.id))
            })?;
        for child in &self.children {
            child
                .task()
                .set_scheduler(scheduler.id(), scheduler.epoch())
                .await;
            scheduler
                .schedule(child.clone() as Arc<dyn Schedulable>, None)
                .await?;
        }
        Ok(RunOutcome::Pending)
    }
}
