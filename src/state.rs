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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a schedulable task.
///
/// Done, Failed and Canceled are terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Created, not yet handed to a scheduler
    Unscheduled,
    /// Reconstructed from persistent storage after a restart
    Restored,
    /// Waiting on the scheduler's run queue
    Queued,
    /// Finished its work, waiting for a slot in the ready pool
    RQueued,
    /// Being executed, or parked waiting for an asynchronous callback
    InProgress,
    /// Result available to the client
    Ready,
    /// Client is moving data
    Transferring,
    /// Completed successfully
    Done,
    /// Completed with an error
    Failed,
    /// Aborted on client or operator request
    Canceled,
}

impl State {
    pub fn is_final(&self) -> bool {
        matches!(self, State::Done | State::Failed | State::Canceled)
    }

    /// Whether `self -> to` is an arc of the lifecycle table.
    pub fn can_transition_to(&self, to: State) -> bool {
        use State::*;
        match self {
            Unscheduled | Restored => matches!(to, Done | Canceled | Failed | Queued),
            Queued => matches!(to, Canceled | Failed | InProgress | Unscheduled),
            InProgress => matches!(to, Canceled | Failed | Queued | RQueued | Ready | Done),
            RQueued => matches!(to, Canceled | Failed | Ready),
            Ready => matches!(to, Canceled | Failed | Transferring | Done),
            Transferring => matches!(to, Canceled | Failed | Done),
            Done | Failed | Canceled => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Unscheduled => "Unscheduled",
            State::Restored => "Restored",
            State::Queued => "Queued",
            State::RQueued => "RQueued",
            State::InProgress => "InProgress",
            State::Ready => "Ready",
            State::Transferring => "Transferring",
            State::Done => "Done",
            State::Failed => "Failed",
            State::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

/// Protocol-level status of an operation or one of its subtasks, independent
/// of the internal lifecycle [`State`].
///
/// Per-subtask codes feed the aggregation in
/// [`CompositeOperation`](crate::composite::CompositeOperation); aggregate-only
/// codes (`PartialSuccess`) never appear on a single subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Waiting to be executed
    Queued,
    /// Work underway
    InProgress,
    /// Result available (file pinned, space allocated)
    Ready,
    /// Completed successfully
    Success,
    /// Completed and subsequently released by the client
    Released,
    /// Aborted
    Aborted,
    /// Failed: the back-end has no free space for the request
    NoFreeSpace,
    /// Failed: the backing space reservation expired
    SpaceLifetimeExpired,
    /// Failed: operation lifetime exceeded
    RequestTimedOut,
    /// Failed: the requested path does not exist
    InvalidPath,
    /// Failed for any other reason
    Failure,
    /// Mixed terminal outcome with at least one success
    PartialSuccess,
    /// The status cannot be determined (no subtasks, unrecognized child code)
    InternalError,
}

impl StatusCode {
    /// Whether a client polling for this status should keep polling.
    pub fn is_processing(&self) -> bool {
        matches!(self, StatusCode::Queued | StatusCode::InProgress)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StatusCode::Aborted
                | StatusCode::NoFreeSpace
                | StatusCode::SpaceLifetimeExpired
                | StatusCode::RequestTimedOut
                | StatusCode::InvalidPath
                | StatusCode::Failure
                | StatusCode::InternalError
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 10] = [
        State::Unscheduled,
        State::Restored,
        State::Queued,
        State::RQueued,
        State::InProgress,
        State::Ready,
        State::Transferring,
        State::Done,
        State::Failed,
        State::Canceled,
    ];

    #[test]
    fn terminal_states_have_no_outgoing_arcs() {
        for from in [State::Done, State::Failed, State::Canceled] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn table_matches_expected_arcs() {
        use State::*;
        let expected: &[(State, &[State])] = &[
            (Unscheduled, &[Done, Canceled, Failed, Queued]),
            (Restored, &[Done, Canceled, Failed, Queued]),
            (Queued, &[Canceled, Failed, InProgress, Unscheduled]),
            (InProgress, &[Canceled, Failed, Queued, RQueued, Ready, Done]),
            (RQueued, &[Canceled, Failed, Ready]),
            (Ready, &[Canceled, Failed, Transferring, Done]),
            (Transferring, &[Canceled, Failed, Done]),
            (Done, &[]),
            (Failed, &[]),
            (Canceled, &[]),
        ];
        for (from, allowed) in expected {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&to),
                    "unexpected table entry for {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn every_state_can_be_canceled_or_failed_unless_final() {
        for from in ALL {
            if !from.is_final() {
                assert!(from.can_transition_to(State::Canceled));
                assert!(from.can_transition_to(State::Failed));
            }
        }
    }

    #[test]
    fn status_classification() {
        assert!(StatusCode::Queued.is_processing());
        assert!(StatusCode::InProgress.is_processing());
        assert!(!StatusCode::Ready.is_processing());
        assert!(StatusCode::NoFreeSpace.is_failure());
        assert!(StatusCode::Aborted.is_failure());
        assert!(!StatusCode::Success.is_failure());
        assert!(!StatusCode::Released.is_failure());
        assert!(!StatusCode::PartialSuccess.is_failure());
    }
}
