// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The best-effort 1PC discipline under failure: the inter-commit window,
//! rollback-and-redeliver, and the silent reply drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mats_core::{MatsError, ProcessContext};
use mats_test::{init_test_logging, MatsTestHarness, RecordingExternalResource};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_broker_commit_failure_after_external_commit_is_message_send_error() {
    init_test_logging();
    let external = RecordingExternalResource::new();
    let harness = MatsTestHarness::assemble(
        mats_inmem_broker(),
        MatsTestHarness::test_config(),
        Some(external.clone()),
    );
    assert!(harness.start().await);

    harness.broker().fail_next_commits(1);
    let result = harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("vanishing").from("caller").to("svc.nowhere");
            init.send(&1)
        })
        .await;

    // The external resource committed, the broker did not: the distinct
    // error surface, and zero messages for the intended flow.
    assert!(matches!(result, Err(MatsError::MessageSend(_))));
    assert_eq!(external.commits(), 1);
    assert_eq!(harness.broker().total_queued(), 0);
    assert_eq!(harness.broker().committed_message_count(), 0);
    harness.stop().await;
}

fn mats_inmem_broker() -> Arc<mats_inmem::InMemoryBroker> {
    mats_inmem::InMemoryBroker::new()
}

#[tokio::test]
async fn test_external_resource_commits_with_each_cycle() {
    init_test_logging();
    let external = RecordingExternalResource::new();
    let harness = MatsTestHarness::assemble(
        mats_inmem_broker(),
        MatsTestHarness::test_config(),
        Some(external.clone()),
    );
    let latch = harness.latch::<(), i64>("test.terminator");
    harness.factory().single("svc.id", |_ctx, n: i64| Ok(n));
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("tx").from("caller").to("svc.id").reply_to(
                "test.terminator",
                &(),
            )?;
            init.request(&1)
        })
        .await
        .unwrap();
    latch.wait_expect(WAIT).await;

    // One commit for the initiation, one per processed stage (svc.id and
    // the terminator), none rolled back. The terminator's commit happens
    // just after the latch fires, so poll for it.
    let deadline = Instant::now() + WAIT;
    while external.commits() < 3 {
        assert!(Instant::now() < deadline, "expected 3 external commits");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(external.commits(), 3);
    assert_eq!(external.rollbacks(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_failing_stage_rolls_back_and_is_redelivered() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_stage = attempts.clone();
    harness.factory().single("svc.flaky", move |_ctx, n: i64| {
        if attempts_in_stage.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("induced first-attempt failure".into());
        }
        Ok(n * 2)
    });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("retry").from("caller").to("svc.flaky").reply_to(
                "test.terminator",
                &(),
            )?;
            init.request(&21)
        })
        .await
        .unwrap();

    // The first delivery failed and rolled back; the redelivery succeeded.
    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    harness.stop().await;
}

#[tokio::test]
async fn test_no_outbound_visible_from_a_failed_stage() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    let sink_latch = harness.latch::<(), i64>("test.sink");
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_stage = attempts.clone();
    harness
        .factory()
        .terminator("svc.sendThenFail", move |ctx: &mut ProcessContext<()>, n: i64| {
            // Queue an emission, then fail: the emission must never become
            // visible from the failed attempt.
            ctx.initiate(|init| {
                init.trace_id("leak-check").to("test.sink");
                init.send(&n)
            })?;
            if attempts_in_stage.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("fail after emitting".into());
            }
            Ok(())
        });
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("atomic").from("caller").to("svc.sendThenFail");
            init.send(&11)
        })
        .await
        .unwrap();

    // Exactly one copy arrives: the one from the successful second attempt.
    assert_eq!(sink_latch.wait_expect(WAIT).await.message, 11);
    sink_latch.expect_nothing(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    harness.stop().await;
}

#[tokio::test]
async fn test_reply_with_empty_stack_is_silently_dropped_and_counted() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().terminator("svc.replier", |ctx: &mut ProcessContext<()>, _n: i64| {
        // A terminator has no one to reply to; this reply just goes void.
        ctx.reply(&0)?;
        Ok(())
    });
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("void-reply").from("caller").to("svc.replier");
            init.send(&1)
        })
        .await
        .unwrap();

    // Wait for the drop to be observed via the counter.
    let deadline = Instant::now() + WAIT;
    while harness.factory().dropped_replies() == 0 {
        assert!(Instant::now() < deadline, "drop counter never bumped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.factory().dropped_replies(), 1);
    // No error, no message anywhere.
    assert_eq!(harness.broker().total_queued(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_validation_failure_causes_no_broker_io() {
    init_test_logging();
    let external = RecordingExternalResource::new();
    let harness = MatsTestHarness::assemble(
        mats_inmem_broker(),
        MatsTestHarness::test_config(),
        Some(external.clone()),
    );
    assert!(harness.start().await);

    let result = harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("incomplete").from("caller");
            // 'to' never set.
            init.send(&1)
        })
        .await;

    assert!(matches!(result, Err(MatsError::Validation(_))));
    assert_eq!(harness.broker().committed_message_count(), 0);
    assert_eq!(harness.broker().total_queued(), 0);
    // The external resource was never touched either.
    assert_eq!(external.begins(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_session_crash_recovers_with_backoff() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.sturdy", |_ctx, n: i64| Ok(n + 1));
    let latch = harness.latch::<(), i64>("test.terminator");

    // Crash the first receives: the affected slots must crash their
    // sessions, back off, reacquire and carry on.
    harness.broker().fail_next_receives(2);
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("crash-recovery")
                .from("caller")
                .to("svc.sturdy")
                .reply_to("test.terminator", &())?;
            init.request(&1)
        })
        .await
        .unwrap();

    assert_eq!(latch.wait_expect(WAIT).await.message, 2);
    harness.stop().await;
}
