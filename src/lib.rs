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

//! Persistent asynchronous scheduler core for storage operations.
//!
//! A client-issued operation (stage a set of files, fetch a set of files) is
//! decomposed into per-file subtasks. Each subtask moves through a strictly
//! validated lifecycle under its own read/write lock, every transition is
//! appended to its history and persisted best-effort, and the parent
//! operation derives a single aggregate status from its children using fixed
//! precedence rules. A change counter lets polling clients block until the
//! aggregate actually changed instead of spinning.
//!
//! Execution itself is external: a [`Scheduler`] implementation decides when
//! [`Schedulable::run`] happens, and a [`StorageDriver`] implementation
//! performs the actual back-end I/O, reporting back through callbacks keyed
//! by task id.

pub mod composite;
pub mod config;
pub mod context;
pub mod credential;
pub mod driver;
pub mod error;
pub mod operation;
pub mod ops;
pub mod sched;
pub mod state;
pub mod store;
pub mod subtask;
pub mod task;

pub use composite::{AbortOutcome, ChangeCounter, CompositeOperation, OperationSummary};
pub use config::SchedulerConfig;
pub use context::{IdGenerator, SchedulerRegistry, TaskContext, TaskRegistry};
pub use credential::{CredentialRegistry, CredentialStore, DelegatedCredential};
pub use driver::{DriverCallback, DriverError, DriverOutcome, FileLocator, StorageDriver};
pub use error::{Error, Result};
pub use operation::{OperationCore, PollBackoff, Requester};
pub use sched::Scheduler;
pub use state::{State, StatusCode};
pub use store::{JobStore, MemoryJobStore, TaskRecord};
pub use subtask::Subtask;
pub use task::{
    recover_task, HistoryEvent, RecoveryAction, RunOutcome, Schedulable, SchedulerAffiliation,
    TaskCore, TaskId, TransitionEvent, TransitionObserver,
};
