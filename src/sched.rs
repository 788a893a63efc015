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

//! Interface to the external scheduler that owns task execution.
//!
//! The core never runs tasks itself; it validates and records lifecycle
//! transitions while an implementation of [`Scheduler`] decides when
//! [`Schedulable::run`] actually happens.

use crate::error::Result;
use crate::task::Schedulable;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A scheduler instance tasks can affiliate with.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Stable identity of this scheduler instance.
    fn id(&self) -> &str;

    /// Incarnation stamp, changing across restarts of the same id.
    fn epoch(&self) -> u64 {
        0
    }

    /// Accept a new task. The scheduler becomes responsible for moving it
    /// from `Unscheduled`/`Restored` through `Queued` into execution.
    /// `delay` postpones the first run.
    async fn schedule(&self, task: Arc<dyn Schedulable>, delay: Option<Duration>) -> Result<()>;

    /// Put an already-affiliated task back on the run queue.
    async fn queue(&self, task: Arc<dyn Schedulable>) -> Result<()>;

    /// Promote a task waiting in `RQueued` into the ready pool if a slot is
    /// available.
    async fn try_to_ready(&self, task: Arc<dyn Schedulable>) -> Result<()>;

    /// Take note of a restored task without scheduling it yet, so instance
    /// accounting survives restarts.
    async fn inherit(&self, task: Arc<dyn Schedulable>);
}
