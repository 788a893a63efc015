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

mod common;

use common::{requester, PinBehavior, TestEnv};
use std::sync::Arc;
use std::time::Duration;
use storsched::ops::stage::StageSubtask;
use storsched::ops::StageOperation;
use storsched::{AbortOutcome, FileLocator, Schedulable, State, StatusCode, Subtask};

const HOUR: Duration = Duration::from_secs(3600);

fn stage_op(env: &TestEnv, count: usize) -> Arc<StageOperation> {
    let ctx = env.ctx.clone();
    let children_ctx = ctx.clone();
    StageOperation::new(
        ctx,
        "stage",
        requester(),
        None,
        None,
        None,
        move |parent| {
            (0..count)
                .map(|i| {
                    StageSubtask::new(
                        children_ctx.clone(),
                        parent,
                        FileLocator::new(format!("srm://host/f{i}")),
                        HOUR,
                    )
                })
                .collect()
        },
    )
}

#[tokio::test]
async fn two_done_one_failed_is_partial_success() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Succeed,
        PinBehavior::Succeed,
        PinBehavior::Fail(StatusCode::InvalidPath, "no such file".to_string()),
    ]);
    let op = stage_op(&env, 3);
    op.schedule(env.scheduler.clone()).await.unwrap();

    assert_eq!(op.aggregate_status().await, StatusCode::PartialSuccess);
    assert_eq!(op.core().task().state().await, State::Failed);
    let summary = op.summary().await;
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        summary.subtask_statuses[2].1,
        StatusCode::InvalidPath
    );
}

#[tokio::test]
async fn all_canceled_is_aborted_regardless_of_order() {
    let env = TestEnv::new();
    env.driver
        .script_pins([PinBehavior::Hold, PinBehavior::Hold, PinBehavior::Hold]);
    let op = stage_op(&env, 3);
    op.schedule(env.scheduler.clone()).await.unwrap();

    // Cancel the children individually, last one first
    for child in op.children().iter().rev() {
        child.abort("canceled by client").await.unwrap();
    }
    assert_eq!(op.aggregate_status().await, StatusCode::Aborted);
    assert_eq!(op.core().task().state().await, State::Failed);
}

#[tokio::test]
async fn all_failed_is_failure() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Fail(StatusCode::Failure, "pool offline".to_string()),
        PinBehavior::Fail(StatusCode::InvalidPath, "no such file".to_string()),
    ]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    assert_eq!(op.aggregate_status().await, StatusCode::Failure);
}

#[tokio::test]
async fn mixed_cancel_and_failure_is_not_aborted() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Hold,
        PinBehavior::Fail(StatusCode::Failure, "pool offline".to_string()),
    ]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    op.children()[0].abort("canceled by client").await.unwrap();
    assert_eq!(op.aggregate_status().await, StatusCode::Failure);
}

#[tokio::test]
async fn no_free_space_takes_precedence_over_space_lifetime_and_progress() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Fail(StatusCode::NoFreeSpace, "no space on any pool".to_string()),
        PinBehavior::Fail(StatusCode::SpaceLifetimeExpired, "reservation gone".to_string()),
        PinBehavior::Hold,
    ]);
    let op = stage_op(&env, 3);
    op.schedule(env.scheduler.clone()).await.unwrap();

    // One child still in progress, but the space failure dominates
    assert_eq!(op.aggregate_status().await, StatusCode::NoFreeSpace);

    env.driver.release_held().await;
    assert_eq!(op.aggregate_status().await, StatusCode::NoFreeSpace);
}

#[tokio::test]
async fn canceled_plus_no_free_space_reports_no_free_space() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Hold,
        PinBehavior::Fail(StatusCode::NoFreeSpace, "no space on any pool".to_string()),
    ]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    op.children()[0].abort("canceled by client").await.unwrap();
    // A canceled child is not a failed child: the space failure still wins
    assert_eq!(op.aggregate_status().await, StatusCode::NoFreeSpace);
}

#[tokio::test]
async fn canceled_plus_success_is_partial_success() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold, PinBehavior::Succeed]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    op.children()[0].abort("canceled by client").await.unwrap();
    assert_eq!(op.aggregate_status().await, StatusCode::PartialSuccess);
}

#[tokio::test]
async fn space_lifetime_expired_reported_without_no_free_space() {
    let env = TestEnv::new();
    env.driver.script_pins([
        PinBehavior::Fail(StatusCode::SpaceLifetimeExpired, "reservation gone".to_string()),
        PinBehavior::Hold,
    ]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    assert_eq!(op.aggregate_status().await, StatusCode::SpaceLifetimeExpired);
}

#[tokio::test]
async fn unscheduled_operation_reports_queued() {
    let env = TestEnv::new();
    let op = stage_op(&env, 2);
    assert_eq!(op.aggregate_status().await, StatusCode::Queued);
}

#[tokio::test]
async fn in_progress_while_any_child_is_running() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Succeed, PinBehavior::Hold]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    assert_eq!(op.aggregate_status().await, StatusCode::InProgress);
    assert_eq!(op.core().task().state().await, State::InProgress);

    env.driver.release_held().await;
    assert_eq!(op.aggregate_status().await, StatusCode::Success);
    assert_eq!(op.core().task().state().await, State::Done);
}

#[tokio::test]
async fn operation_without_subtasks_is_an_internal_error() {
    let env = TestEnv::new();
    let ctx = env.ctx.clone();
    let op: Arc<StageOperation> =
        StageOperation::new(ctx, "stage", requester(), None, None, None, |_| Vec::new());

    assert_eq!(op.aggregate_status().await, StatusCode::InternalError);
    assert_eq!(op.core().task().state().await, State::Failed);
}

#[tokio::test]
async fn abort_folds_child_outcomes() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Succeed, PinBehavior::Hold]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    // One child already done, one still aborting: overall abort succeeds
    assert_eq!(op.abort("canceled by client").await, AbortOutcome::Success);
    assert_eq!(op.children()[0].task().state().await, State::Done);
    assert_eq!(op.children()[1].task().state().await, State::Canceled);
    assert_eq!(op.aggregate_status().await, StatusCode::Aborted);
}
