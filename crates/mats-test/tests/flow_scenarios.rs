// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end flow tests over the in-memory broker: request/reply, state
//! between stages, sideways calls and history retention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mats_core::{CallType, KeepTrace, ProcessContext};
use mats_test::{init_test_logging, MatsTestHarness};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
struct TermState {
    label: String,
}

#[tokio::test]
async fn test_single_stage_echo() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.double", |_ctx, x: i64| Ok(x * 2));
    let latch = harness.latch::<TermState, i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("t1").from("caller").to("svc.double").reply_to(
                "test.terminator",
                &TermState {
                    label: "echo".into(),
                },
            )?;
            init.request(&21)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 42);
    assert_eq!(result.state.label, "echo");
    assert_eq!(result.trace.trace_id(), "t1");
    harness.stop().await;
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct SeenState {
    seen: i64,
}

#[tokio::test]
async fn test_two_stage_endpoint_with_state() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.square", |_ctx, m: i64| Ok(m * m));
    harness
        .factory()
        .staged::<i64, SeenState>("svc.addAndSquare")
        .stage(|ctx, n: i64| {
            ctx.state().seen = n;
            ctx.request("svc.square", &(n + 1))?;
            Ok(())
        })
        .last_stage(|ctx, squared: i64| {
            let seen = ctx.state().seen;
            ctx.reply(&(squared + seen))?;
            Ok(())
        });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("two-stage")
                .from("caller")
                .to("svc.addAndSquare")
                .reply_to("test.terminator", &())?;
            init.request(&10)
        })
        .await
        .unwrap();

    // (10 + 1)^2 + 10 = 131.
    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 131);
    harness.stop().await;
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct AccState {
    acc: i64,
}

#[tokio::test]
async fn test_next_passes_sideways_without_reply() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness
        .factory()
        .staged::<i64, AccState>("svc.accumulate")
        .stage(|ctx, _n: i64| {
            ctx.state().acc = 3;
            ctx.next(&4)?;
            Ok(())
        })
        .last_stage(|ctx, payload: i64| {
            let acc = ctx.state().acc;
            ctx.reply(&(payload + acc))?;
            Ok(())
        });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("next-flow")
                .from("caller")
                .to("svc.accumulate")
                .reply_to("test.terminator", &())?;
            init.request(&0)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 7);
    harness.stop().await;
}

#[tokio::test]
async fn test_compact_trace_pruning_across_four_hops() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.inner", |_ctx, m: i64| Ok(m + 1));
    harness
        .factory()
        .staged::<i64, SeenState>("svc.outer")
        .stage(|ctx, n: i64| {
            ctx.state().seen = n;
            ctx.request("svc.inner", &n)?;
            Ok(())
        })
        .last_stage(|ctx, r: i64| {
            ctx.reply(&r)?;
            Ok(())
        });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("pruning")
                .keep_trace(KeepTrace::Compact)
                .from("caller")
                .to("svc.outer")
                .reply_to("test.terminator", &())?;
            init.request(&5)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    let trace = &result.trace;

    // Four hops: REQUEST to outer, REQUEST to inner, REPLY to outer.stage1,
    // REPLY to the terminator. Only the current call retains its data.
    let calls = trace.call_flow();
    assert_eq!(calls.len(), 4);
    assert_eq!(
        calls.iter().map(|c| c.call_type()).collect::<Vec<_>>(),
        vec![
            CallType::Request,
            CallType::Request,
            CallType::Reply,
            CallType::Reply
        ]
    );
    for call in &calls[..3] {
        assert_eq!(call.data(), None, "history call retained data");
    }
    assert!(calls[3].data().is_some());

    // State frames condensed to one per reachable height (terminator: 0).
    let frames = trace.state_flow();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].height(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_full_trace_keeps_history() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.id", |_ctx, n: i64| Ok(n));
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("full")
                .keep_trace(KeepTrace::Full)
                .from("caller")
                .to("svc.id")
                .reply_to("test.terminator", &())?;
            init.request(&9)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.trace.call_flow().len(), 2);
    assert!(result.trace.call_flow().iter().all(|c| c.data().is_some()));
    harness.stop().await;
}

#[tokio::test]
async fn test_nested_initiation_appends_trace_id() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    let nested_latch = harness.latch::<(), i64>("test.nested");
    harness.factory().terminator("svc.fanout", |ctx: &mut ProcessContext<()>, n: i64| {
        ctx.initiate(|init| {
            init.trace_id("inner").to("test.nested");
            init.send(&(n * 10))
        })?;
        Ok(())
    });
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("outer").from("caller").to("svc.fanout");
            init.send(&4)
        })
        .await
        .unwrap();

    let result = nested_latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 40);
    assert_eq!(result.trace.trace_id(), "outer|inner");
    // The nested flow's origin is the initiating stage.
    assert_eq!(result.trace.initiator_id(), Some("svc.fanout"));
    harness.stop().await;
}

#[tokio::test]
async fn test_non_persistent_and_interactive_propagate_across_hops() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.hop", |_ctx, n: i64| Ok(n));
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("flags")
                .non_persistent()
                .interactive()
                .from("caller")
                .to("svc.hop")
                .reply_to("test.terminator", &())?;
            init.request(&1)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert!(result.trace.is_non_persistent());
    assert!(result.trace.is_interactive());
    harness.stop().await;
}

#[tokio::test]
async fn test_trace_properties_stick_for_the_whole_flow() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness.factory().single("svc.touch", |ctx, n: i64| {
        // Properties are visible mid-flow, and stages can add their own.
        let tenant = ctx.get_trace_property("tenant").unwrap_or("-").to_string();
        ctx.set_trace_property("tenant-seen-at-stage", tenant);
        ctx.set_trace_property("touched", "yes");
        Ok(n)
    });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("props")
                .from("caller")
                .to("svc.touch")
                .set_trace_property("tenant", "acme")
                .reply_to("test.terminator", &())?;
            init.request(&1)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.trace.trace_property("tenant"), Some("acme"));
    assert_eq!(result.trace.trace_property("tenant-seen-at-stage"), Some("acme"));
    assert_eq!(result.trace.trace_property("touched"), Some("yes"));
    harness.stop().await;
}

#[tokio::test]
async fn test_side_channel_payloads_ride_outside_the_envelope() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    let latch = harness.latch::<(), String>("test.terminator");
    harness.factory().terminator("svc.docs", |ctx: &mut ProcessContext<()>, _n: i64| {
        let doc = String::from_utf8_lossy(ctx.get_bytes("doc").unwrap_or_default()).into_owned();
        let csv = ctx.get_string("csv").unwrap_or("-").to_string();
        ctx.initiate(|init| {
            init.trace_id("ack").to("test.terminator");
            init.send(&format!("{}/{}", doc, csv))
        })?;
        Ok(())
    });
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("payloads")
                .from("caller")
                .to("svc.docs")
                .add_bytes("doc", &b"pdf-bytes"[..])
                .add_string("csv", "a,b,c");
            init.send(&1)
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, "pdf-bytes/a,b,c");
    harness.stop().await;
}

#[tokio::test]
async fn test_request_with_initial_target_state() {
    init_test_logging();
    let harness = MatsTestHarness::new();
    harness
        .factory()
        .staged::<i64, SeenState>("svc.seeded")
        .last_stage(|ctx, n: i64| {
            // Seeded by the initiation rather than freshly constructed.
            let seen = ctx.state().seen;
            ctx.reply(&(n + seen))?;
            Ok(())
        });
    let latch = harness.latch::<(), i64>("test.terminator");
    assert!(harness.start().await);

    harness
        .factory()
        .default_initiator()
        .initiate(|init| {
            init.trace_id("seeded")
                .from("caller")
                .to("svc.seeded")
                .reply_to("test.terminator", &())?;
            init.request_with_state(&1, &SeenState { seen: 100 })
        })
        .await
        .unwrap();

    let result = latch.wait_expect(WAIT).await;
    assert_eq!(result.message, 101);
    harness.stop().await;
}
