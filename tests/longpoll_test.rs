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
use storsched::{FileLocator, StatusCode};

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
async fn waiter_observes_completion_within_deadline() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold, PinBehavior::Hold]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();
    assert_eq!(op.aggregate_status().await, StatusCode::InProgress);

    let waiter = {
        let op = op.clone();
        tokio::spawn(async move { op.status_within(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    env.driver.release_held().await;

    assert_eq!(waiter.await.unwrap(), StatusCode::Success);
}

#[tokio::test]
async fn expired_deadline_returns_current_status() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold]);
    let op = stage_op(&env, 1);
    op.schedule(env.scheduler.clone()).await.unwrap();

    let status = op.status_within(Duration::from_millis(50)).await;
    assert_eq!(status, StatusCode::InProgress);
    assert_eq!(env.driver.held_count(), 1);
}

#[tokio::test]
async fn settled_operation_answers_immediately() {
    let env = TestEnv::new();
    let op = stage_op(&env, 1);
    op.schedule(env.scheduler.clone()).await.unwrap();

    // Must not block at all even with a long deadline
    let status = tokio::time::timeout(
        Duration::from_millis(50),
        op.status_within(Duration::from_secs(3600)),
    )
    .await
    .expect("status_within blocked on a settled operation");
    assert_eq!(status, StatusCode::Success);
}

#[tokio::test]
async fn change_counter_is_monotonic_across_child_completions() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold, PinBehavior::Hold]);
    let op = stage_op(&env, 2);
    op.schedule(env.scheduler.clone()).await.unwrap();

    let before = op.change_counter().get();
    env.driver.release_held().await;
    let after = op.change_counter().get();
    assert!(after >= before + 2, "each completion must bump the counter");
}

#[tokio::test]
async fn concurrent_waiters_all_wake() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold]);
    let op = stage_op(&env, 1);
    op.schedule(env.scheduler.clone()).await.unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let op = op.clone();
            tokio::spawn(async move { op.status_within(Duration::from_secs(5)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    env.driver.release_held().await;

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), StatusCode::Success);
    }
}

#[tokio::test]
async fn poll_delay_backs_off_then_freezes() {
    let env = TestEnv::new();
    env.driver.script_pins([PinBehavior::Hold]);
    let op = stage_op(&env, 1);
    op.schedule(env.scheduler.clone()).await.unwrap();

    let first = op.core().next_poll_delay().await;
    let second = op.core().next_poll_delay().await;
    assert!(second > first);

    env.driver.release_held().await;
    // Settling the operation freezes the delay
    assert_eq!(op.aggregate_status().await, StatusCode::Success);
    let frozen = op.core().next_poll_delay().await;
    assert_eq!(op.core().next_poll_delay().await, frozen);
}
