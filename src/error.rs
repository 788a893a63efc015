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

use crate::state::State;
use crate::task::TaskId;
use thiserror::Error;

/// Error type for scheduler core operations.
///
/// `IllegalStateTransition` always signals a programming error or a lost race
/// and is surfaced to the caller; persistence failures are logged at the save
/// path and never reach this enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error("illegal state transition from {from} to {to}")]
    IllegalStateTransition { from: State, to: State },

    #[error("cannot enter {to} without a scheduler affiliation")]
    NoScheduler { to: State },

    #[error("cannot extend lifetime: operation was aborted")]
    Aborted,

    #[error("cannot extend lifetime: operation has been released")]
    Released,

    #[error("cannot extend lifetime: operation has failed")]
    OperationFailed,

    #[error("lifetime expired")]
    Expired,

    #[error("task {0} does not correspond to any known task")]
    TaskNotFound(TaskId),

    #[error("credential {0} not found")]
    CredentialNotFound(u64),

    #[error("persistence error: {0}")]
    Store(String),

    #[error("storage driver error: {0}")]
    Driver(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A subtask run failed but may be retried by the scheduler.
    #[error("non-fatal failure: {0}")]
    NonFatal(String),

    /// A subtask run failed with no prospect of a retry succeeding.
    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("other error: {0}")]
    Other(String),
}

/// A specialized Result type for scheduler core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Create an Other error from any error type
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Other(error.into().to_string())
    }
}
