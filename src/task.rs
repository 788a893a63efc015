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

//! Base unit of scheduled activity: identity, lifetime, validated state,
//! append-only history and best-effort persistence, guarded by one
//! read/write lock per task.
//!
//! A transition takes the write lock, validates against the lifecycle table,
//! mutates and persists, then downgrades to a read lock before notifying
//! observers. Observers therefore never see a half-applied transition, and a
//! later transition cannot overtake the notifications of an earlier one.

use crate::context::TaskContext;
use crate::error::{Error, Result};
use crate::sched::Scheduler;
use crate::state::{State, StatusCode};
use crate::store::TaskRecord;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Unique identity of a task, assigned by the context's id generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a task's append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: u64,
    pub state: State,
    pub description: String,
    pub at: SystemTime,
}

impl HistoryEvent {
    fn render(&self) -> String {
        let at = DateTime::<Utc>::from(self.at).to_rfc3339_opts(SecondsFormat::Millis, true);
        format!(" at {} state {} : {}", at, self.state, self.description)
    }
}

/// Affiliation with the external scheduler instance that owns a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerAffiliation {
    pub id: String,
    /// Incarnation stamp distinguishing restarts of the same scheduler id
    pub epoch: u64,
}

/// Event handed to transition observers after the write lock has been
/// downgraded. Observers must not call mutators of the originating task and
/// should prefer this payload over getters.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub task_id: TaskId,
    pub from: State,
    pub to: State,
    pub description: String,
}

#[async_trait]
pub trait TransitionObserver: Send + Sync {
    async fn on_transition(&self, event: &TransitionEvent);
}

/// Outcome of one scheduler-driven [`Schedulable::run`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The unit finished its synchronous work.
    Completed,
    /// The unit registered an asynchronous continuation and parked itself in
    /// a waiting state; a driver callback will resume it.
    Pending,
}

/// Decision of the per-variant recovery hook for tasks reloaded mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Resume,
    Fail,
}

/// Anything the external scheduler can queue and run.
#[async_trait]
pub trait Schedulable: Send + Sync + 'static {
    fn task(&self) -> &TaskCore;

    /// Execute one scheduling quantum. May complete synchronously, fail with
    /// [`Error::NonFatal`]/[`Error::Fatal`], or register an asynchronous
    /// callback and return [`RunOutcome::Pending`].
    async fn run(&self) -> Result<RunOutcome>;

    /// Called when the task was reloaded in `InProgress` after a restart.
    /// Resuming is rare; the default gives up.
    async fn recover(&self) -> RecoveryAction {
        RecoveryAction::Fail
    }
}

#[derive(Debug)]
struct TaskInner {
    state: State,
    lifetime: Duration,
    scheduler: Option<SchedulerAffiliation>,
    status_code: Option<StatusCode>,
    retries: u32,
    history: Vec<HistoryEvent>,
    last_transition_at: SystemTime,
    saved_in_final_state: bool,
}

type PayloadSource = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Base schedulable unit.
///
/// Concrete operations and subtasks embed a `TaskCore` and delegate all
/// lifecycle handling to it.
pub struct TaskCore {
    id: TaskId,
    kind: &'static str,
    created_at: SystemTime,
    ctx: TaskContext,
    inner: RwLock<TaskInner>,
    observers: std::sync::Mutex<Vec<Arc<dyn TransitionObserver>>>,
    payload_source: std::sync::Mutex<Option<PayloadSource>>,
}

impl TaskCore {
    pub fn new(ctx: TaskContext, kind: &'static str, lifetime: Duration) -> Self {
        let id = TaskId(ctx.ids.next());
        let now = SystemTime::now();
        let history = vec![HistoryEvent {
            id: ctx.ids.next(),
            state: State::Unscheduled,
            description: "created".to_string(),
            at: now,
        }];
        Self {
            id,
            kind,
            created_at: now,
            ctx,
            inner: RwLock::new(TaskInner {
                state: State::Unscheduled,
                lifetime,
                scheduler: None,
                status_code: None,
                retries: 0,
                history,
                last_transition_at: now,
                saved_in_final_state: false,
            }),
            observers: std::sync::Mutex::new(Vec::new()),
            payload_source: std::sync::Mutex::new(None),
        }
    }

    /// Reconstruct a task from a persisted record.
    ///
    /// Non-terminal states other than `InProgress` come back as `Restored`;
    /// `InProgress` is kept so the recovery hook can fail or resume it
    /// through a legal arc.
    pub fn from_record(ctx: TaskContext, kind: &'static str, record: &TaskRecord) -> Self {
        let state = if record.state.is_final() || record.state == State::InProgress {
            record.state
        } else {
            State::Restored
        };
        let mut history = record.history.clone();
        history.sort_by_key(|e| e.at);
        if state == State::Restored {
            history.push(HistoryEvent {
                id: ctx.ids.next(),
                state,
                description: "restored from persistent storage".to_string(),
                at: SystemTime::now(),
            });
        }
        Self {
            id: record.id,
            kind,
            created_at: record.created_at,
            ctx,
            inner: RwLock::new(TaskInner {
                state,
                lifetime: record.lifetime,
                scheduler: record.scheduler.clone(),
                status_code: record.status_code,
                retries: record.retries,
                history,
                last_transition_at: record.created_at,
                saved_in_final_state: record.state.is_final(),
            }),
            observers: std::sync::Mutex::new(Vec::new()),
            payload_source: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub async fn state(&self) -> State {
        self.inner.read().await.state
    }

    pub async fn status_code(&self) -> Option<StatusCode> {
        self.inner.read().await.status_code
    }

    pub async fn set_status_code(&self, code: Option<StatusCode>) {
        self.inner.write().await.status_code = code;
    }

    pub async fn scheduler(&self) -> Option<SchedulerAffiliation> {
        self.inner.read().await.scheduler.clone()
    }

    pub async fn retries(&self) -> u32 {
        self.inner.read().await.retries
    }

    pub async fn retries_exhausted(&self) -> bool {
        self.inner.read().await.retries >= self.ctx.config.max_retries
    }

    pub async fn lifetime(&self) -> Duration {
        self.inner.read().await.lifetime
    }

    pub async fn last_transition_at(&self) -> SystemTime {
        self.inner.read().await.last_transition_at
    }

    /// Remaining lifetime, clamped to zero in final states.
    pub async fn remaining_lifetime(&self) -> Duration {
        let inner = self.inner.read().await;
        if inner.state.is_final() {
            return Duration::ZERO;
        }
        (self.created_at + inner.lifetime)
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the lifetime has elapsed while the task is non-final.
    pub async fn is_expired(&self) -> bool {
        let inner = self.inner.read().await;
        !inner.state.is_final() && self.created_at + inner.lifetime < SystemTime::now()
    }

    pub async fn history(&self) -> Vec<HistoryEvent> {
        self.inner.read().await.history.clone()
    }

    /// Rendering of the most recent history entry, used as the
    /// human-readable explanation in status responses.
    pub async fn latest_event(&self) -> String {
        let inner = self.inner.read().await;
        inner.history.last().map(HistoryEvent::render).unwrap_or_default()
    }

    /// Full transition log, one line per event.
    pub async fn history_text(&self) -> String {
        let inner = self.inner.read().await;
        let mut out = String::new();
        for event in &inner.history {
            out.push_str(&event.render());
            out.push('\n');
        }
        out
    }

    /// Append a free-form history entry without changing state.
    pub async fn add_history_event(&self, description: &str) {
        let mut inner = self.inner.write().await;
        let event = HistoryEvent {
            id: self.ctx.ids.next(),
            state: inner.state,
            description: description.to_string(),
            at: SystemTime::now(),
        };
        inner.history.push(event);
    }

    pub fn add_observer(&self, observer: Arc<dyn TransitionObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Install the closure that snapshots variant-specific payload for
    /// persistence records.
    pub fn set_payload_source<F>(&self, source: F)
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        *self.payload_source.lock().unwrap() = Some(Box::new(source));
    }

    fn payload(&self) -> serde_json::Value {
        match &*self.payload_source.lock().unwrap() {
            Some(source) => source(),
            None => serde_json::Value::Null,
        }
    }

    fn record_locked(&self, inner: &TaskInner) -> TaskRecord {
        TaskRecord {
            id: self.id,
            kind: self.kind.to_string(),
            state: inner.state,
            created_at: self.created_at,
            lifetime: inner.lifetime,
            scheduler: inner.scheduler.clone(),
            status_code: inner.status_code,
            retries: inner.retries,
            history: inner.history.clone(),
            payload: self.payload(),
        }
    }

    /// Persist under the already-held write lock. Failures are logged and
    /// never propagated: the in-memory state stays authoritative. A terminal
    /// state is persisted at most once.
    async fn persist_locked(&self, inner: &mut TaskInner, force: bool) {
        if inner.saved_in_final_state {
            return;
        }
        let is_final = inner.state.is_final();
        let record = self.record_locked(inner);
        match self.ctx.store.save(&record, force || is_final).await {
            Ok(()) => inner.saved_in_final_state = is_final,
            Err(e) => error!(task = %self.id, "failed to persist task: {e}"),
        }
    }

    /// Persist the current snapshot.
    pub async fn save(&self, force: bool) {
        let mut inner = self.inner.write().await;
        self.persist_locked(&mut inner, force).await;
    }

    /// Record which scheduler instance owns this task. Persisted immediately
    /// since the affiliation identifies the owner across restarts.
    pub async fn set_scheduler(&self, scheduler_id: &str, epoch: u64) {
        let mut inner = self.inner.write().await;
        let changed = match &inner.scheduler {
            Some(aff) => aff.id != scheduler_id || aff.epoch != epoch,
            None => true,
        };
        if changed {
            inner.scheduler = Some(SchedulerAffiliation {
                id: scheduler_id.to_string(),
                epoch,
            });
            self.persist_locked(&mut inner, true).await;
        }
    }

    /// Perform a validated state transition.
    pub async fn transition(&self, new_state: State, description: &str) -> Result<()> {
        self.transition_with_status(new_state, description, None).await
    }

    /// Perform a validated state transition, optionally recording a protocol
    /// status alongside it.
    ///
    /// Protocol: write lock; same-state is a no-op; an arc missing from the
    /// table fails with [`Error::IllegalStateTransition`] and leaves the
    /// state unchanged; non-terminal targets (other than returning to the
    /// unscheduled pool) require a scheduler affiliation; on success the
    /// history is appended, the snapshot persisted (forced when terminal),
    /// the lock downgraded, and observers notified in registration order.
    pub async fn transition_with_status(
        &self,
        new_state: State,
        description: &str,
        status: Option<StatusCode>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let old_state = inner.state;
        if new_state == old_state {
            return Ok(());
        }
        if !old_state.can_transition_to(new_state) {
            return Err(Error::IllegalStateTransition {
                from: old_state,
                to: new_state,
            });
        }
        if !new_state.is_final()
            && !matches!(new_state, State::Unscheduled | State::Restored)
            && inner.scheduler.is_none()
        {
            return Err(Error::NoScheduler { to: new_state });
        }

        inner.state = new_state;
        if let Some(code) = status {
            inner.status_code = Some(code);
        }
        let now = SystemTime::now();
        inner.last_transition_at = now;
        inner.history.push(HistoryEvent {
            id: self.ctx.ids.next(),
            state: new_state,
            description: description.to_string(),
            at: now,
        });
        if old_state == State::InProgress && new_state == State::Queued {
            inner.retries += 1;
        }
        debug!(task = %self.id, kind = self.kind, %old_state, %new_state, "state changed");

        self.persist_locked(&mut inner, new_state.is_final()).await;

        let read = inner.downgrade();
        let event = TransitionEvent {
            task_id: self.id,
            from: old_state,
            to: new_state,
            description: description.to_string(),
        };
        let observers: Vec<_> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_transition(&event).await;
        }
        drop(read);
        Ok(())
    }

    /// Deliver the synthetic "restored" pseudo-transition to observers.
    pub(crate) async fn notify_restored(&self) {
        let read = self.inner.read().await;
        let event = TransitionEvent {
            task_id: self.id,
            from: read.state,
            to: read.state,
            description: "restored from persistent storage".to_string(),
        };
        let observers: Vec<_> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_transition(&event).await;
        }
    }

    /// Extend the lifetime to at least `requested`, clamped by the owning
    /// operation's remaining lifetime when `cap` is given.
    ///
    /// Rejected on terminal states with a cause-distinct error. Requesting
    /// less than the remaining lifetime returns the remaining lifetime
    /// unchanged.
    pub async fn extend_lifetime(
        &self,
        requested: Duration,
        cap: Option<Duration>,
    ) -> Result<Duration> {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Canceled => return Err(Error::Aborted),
            State::Done => return Err(Error::Released),
            State::Failed => return Err(Error::OperationFailed),
            _ => {}
        }
        let requested = match cap {
            Some(cap) => requested.min(cap),
            None => requested,
        };
        let now = SystemTime::now();
        let remaining = (self.created_at + inner.lifetime)
            .duration_since(now)
            .unwrap_or(Duration::ZERO);
        if remaining >= requested {
            return Ok(remaining);
        }
        inner.lifetime =
            now.duration_since(self.created_at).unwrap_or(Duration::ZERO) + requested;
        self.persist_locked(&mut inner, false).await;
        Ok(requested)
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Reattach a task reloaded from storage to a (possibly new) scheduler
/// instance and resume or fail it.
///
/// Expired tasks are failed immediately; tasks reloaded mid-run consult the
/// per-variant recovery hook; everything else is handed back to the scheduler
/// to resume queued execution. Illegal transitions on this path are logged
/// and recovery continues.
pub async fn recover_task(task: Arc<dyn Schedulable>, scheduler: Arc<dyn Scheduler>) -> Result<()> {
    let core = task.task();
    core.set_scheduler(scheduler.id(), scheduler.epoch()).await;
    scheduler.inherit(task.clone()).await;
    core.notify_restored().await;

    if core.is_expired().await {
        if let Err(e) = core
            .transition_with_status(
                State::Failed,
                "lifetime expired during restart",
                Some(StatusCode::RequestTimedOut),
            )
            .await
        {
            warn!(task = %core.id(), "illegal state transition while expiring restored task: {e}");
        }
        return Ok(());
    }

    let state = core.state().await;
    if state.is_final() {
        return Ok(());
    }
    if state == State::InProgress {
        match task.recover().await {
            RecoveryAction::Resume => {
                info!(task = %core.id(), "resuming task interrupted by restart");
                if let Err(e) = core.transition(State::Queued, "resumed after restart").await {
                    warn!(task = %core.id(), "illegal state transition while resuming: {e}");
                    return Ok(());
                }
                scheduler.queue(task.clone()).await?;
            }
            RecoveryAction::Fail => {
                info!(task = %core.id(), "failing task interrupted by restart");
                if let Err(e) = core
                    .transition(State::Failed, "interrupted by service restart")
                    .await
                {
                    warn!(task = %core.id(), "illegal state transition while failing restored task: {e}");
                }
            }
        }
        return Ok(());
    }
    scheduler.schedule(task, None).await
}
