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

//! Concrete operation variants built on the composite scheduler core.

pub mod fetch;
pub mod stage;

use crate::composite::CompositeOperation;

/// Bring files online and keep them pinned until released.
pub type StageOperation = CompositeOperation<stage::StageSubtask>;

/// Make files available for client-driven download.
pub type FetchOperation = CompositeOperation<fetch::FetchSubtask>;
