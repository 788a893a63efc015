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

//! Client-facing operation layer on top of [`TaskCore`]: requester identity,
//! credential binding, adaptive poll delay and lifetime expiration.

use crate::context::TaskContext;
use crate::state::{State, StatusCode};
use crate::task::{TaskCore, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identity of the client that submitted an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requester {
    pub user: String,
    pub client_host: Option<String>,
}

/// Adaptive delay suggested to status-polling clients.
///
/// Doubles on every poll up to a configured maximum, and freezes once all
/// subtasks are terminal so late pollers are not pushed further out.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    initial: Duration,
    delay: Duration,
    max: Duration,
    frozen: bool,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            delay: initial,
            max,
            frozen: false,
        }
    }

    pub fn current(&self) -> Duration {
        self.delay
    }

    /// Advance the delay for the poll that just happened.
    pub fn bump(&mut self) -> Duration {
        let current = self.delay;
        if !self.frozen {
            self.delay = (self.delay * 2).min(self.max);
        }
        current
    }

    /// Restart from the initial delay, e.g. after a state change.
    pub fn reset(&mut self) {
        if !self.frozen {
            self.delay = self.initial;
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }
}

/// State shared by all client-submitted operations, composite or not.
#[derive(Debug)]
pub struct OperationCore {
    task: TaskCore,
    requester: Requester,
    credential_id: Option<u64>,
    description: Option<String>,
    backoff: Mutex<PollBackoff>,
}

impl OperationCore {
    pub fn new(
        ctx: TaskContext,
        kind: &'static str,
        requester: Requester,
        credential_id: Option<u64>,
        description: Option<String>,
        lifetime: Option<Duration>,
    ) -> Self {
        let lifetime = lifetime.unwrap_or(ctx.config.default_lifetime);
        let backoff = PollBackoff::new(ctx.config.initial_poll_delay, ctx.config.max_poll_delay);
        Self {
            task: TaskCore::new(ctx, kind, lifetime),
            requester,
            credential_id,
            description,
            backoff: Mutex::new(backoff),
        }
    }

    pub fn from_parts(
        task: TaskCore,
        requester: Requester,
        credential_id: Option<u64>,
        description: Option<String>,
    ) -> Self {
        let backoff = PollBackoff::new(
            task.context().config.initial_poll_delay,
            task.context().config.max_poll_delay,
        );
        Self {
            task,
            requester,
            credential_id,
            description,
            backoff: Mutex::new(backoff),
        }
    }

    pub fn task(&self) -> &TaskCore {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn credential_id(&self) -> Option<u64> {
        self.credential_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Delay to hand out with the current status response, advancing the
    /// backoff for the next poll.
    pub async fn next_poll_delay(&self) -> Duration {
        self.backoff.lock().await.bump()
    }

    pub async fn reset_poll_delay(&self) {
        self.backoff.lock().await.reset();
    }

    pub async fn freeze_poll_delay(&self) {
        self.backoff.lock().await.freeze();
    }

    /// Fail the operation with `RequestTimedOut` if its lifetime has elapsed.
    ///
    /// Returns true if the operation is (now) expired. Applies to every
    /// non-final state, including `Ready` and `Transferring`.
    pub async fn check_expiration(&self) -> bool {
        if !self.task.is_expired().await {
            return false;
        }
        info!(task = %self.task.id(), kind = self.task.kind(), "operation lifetime expired");
        if let Err(e) = self
            .task
            .transition_with_status(
                State::Failed,
                "lifetime expired",
                Some(StatusCode::RequestTimedOut),
            )
            .await
        {
            // Lost a race against another terminal transition
            warn!(task = %self.task.id(), "could not expire operation: {e}");
        }
        true
    }
}
