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

//! Abstraction of the storage back-end.
//!
//! Every driver call is fire-and-forget: the `Result` covers submission only,
//! and the real outcome arrives later through the [`DriverCallback`] the
//! caller registered. Callbacks carry the task id they belong to and must
//! tolerate arriving after the task has already moved on.

use crate::error::Result;
use crate::state::StatusCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Location of a file on the storage back-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocator {
    pub url: String,
}

impl FileLocator {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Successful result of an asynchronous driver call.
#[derive(Debug, Clone)]
pub enum DriverOutcome {
    Pinned {
        pin_id: String,
        file_id: String,
        size: Option<u64>,
    },
    Unpinned,
    TransferUrl {
        url: String,
    },
    PutPrepared {
        upload_url: String,
    },
    Copied {
        bytes: u64,
    },
}

/// Failure of an asynchronous driver call, carrying the protocol status the
/// failure maps to.
#[derive(Debug, Clone)]
pub struct DriverError {
    pub status: StatusCode,
    pub message: String,
}

impl DriverError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

/// Continuation of a fire-and-forget driver call.
#[async_trait]
pub trait DriverCallback: Send + Sync {
    async fn on_success(&self, outcome: DriverOutcome);
    async fn on_failure(&self, error: DriverError);
    /// The driver gave up waiting for the back-end. Implementations may
    /// resubmit.
    async fn on_timeout(&self);
}

/// Asynchronous interface to the storage back-end.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Pin a file so it stays online for `lifetime`.
    async fn pin(
        &self,
        file: &FileLocator,
        lifetime: Option<Duration>,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()>;

    /// Release a pin previously obtained through [`StorageDriver::pin`].
    async fn unpin(&self, file_id: &str, pin_id: &str, cb: Arc<dyn DriverCallback>) -> Result<()>;

    /// Allocate a namespace entry and upload slot for an incoming file.
    async fn prepare_put(
        &self,
        dest: &FileLocator,
        size: Option<u64>,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()>;

    /// Resolve a client-usable transfer URL for an online file.
    async fn resolve_transfer_url(
        &self,
        file: &FileLocator,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()>;

    /// Server-side copy between two locations.
    async fn copy(
        &self,
        source: &FileLocator,
        dest: &FileLocator,
        cb: Arc<dyn DriverCallback>,
    ) -> Result<()>;
}
