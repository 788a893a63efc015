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

use std::time::Duration;

/// Scheduler core config
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lifetime granted to operations that do not request one
    pub default_lifetime: Duration,
    /// Maximum re-queues of a subtask after non-fatal failures
    pub max_retries: u32,
    /// First delay suggested to polling clients
    pub initial_poll_delay: Duration,
    /// Upper bound for the adaptive poll delay
    pub max_poll_delay: Duration,
    /// Maximum number of cached delegated credentials
    pub credential_cache_capacity: usize,
    /// Time-to-live of a cached delegated credential
    pub credential_cache_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(24 * 60 * 60),
            max_retries: 10,
            initial_poll_delay: Duration::from_secs(1),
            max_poll_delay: Duration::from_secs(60),
            credential_cache_capacity: 1000,
            credential_cache_ttl: Duration::from_secs(600),
        }
    }
}
