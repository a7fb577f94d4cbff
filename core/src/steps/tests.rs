//! Tests for the standard steps outside of an execution

use std::collections::BTreeMap;
use std::sync::Weak;
use std::time::Duration;
use tokio_test::assert_ok;

use super::*;
use crate::engine::{ScriptRuntime, StepContext, StepDescriptor, StepExecution};
use crate::engine::ThreadId;
use crate::error::{codes, Failure};
use crate::flow::NodeId;
use crate::script::{ScriptEngine, Val};

fn closure(source: &str) -> Val {
    let body = ScriptEngine::new(1_000)
        .load_body("branch", source)
        .expect("body should compile");
    Val::Closure(body)
}

// ============================================================================
// Basic Steps
// ============================================================================

#[test]
fn test_echo_completes_synchronously() {
    let ctx = StepContext::detached("echo", None);
    let mut step = Echo.create(&[Val::from("hello")]).unwrap();

    assert_eq!(step.start(&ctx), Ok(true));
    assert_eq!(ctx.outcome(), Some(Ok(Val::Null)));
}

#[test]
fn test_error_fails_from_start() {
    let ctx = StepContext::detached("error", None);
    let mut step = ErrorStep.create(&[Val::from("broken")]).unwrap();

    let failure = step.start(&ctx).unwrap_err();
    assert_eq!(failure.code, codes::STEP_FAILED);
    assert_eq!(failure.message, "broken");
}

#[test]
fn test_instant_defaults_to_null() {
    let ctx = StepContext::detached("instant", None);
    Instant.create(&[]).unwrap().start(&ctx).unwrap();
    assert_eq!(ctx.outcome(), Some(Ok(Val::Null)));

    let ctx = StepContext::detached("instant", None);
    Instant.create(&[Val::Num(3.0)]).unwrap().start(&ctx).unwrap();
    assert_eq!(ctx.outcome(), Some(Ok(Val::Num(3.0))));
}

#[test]
fn test_argument_validation() {
    let err = Sleep.create(&[Val::from("soon")]).err().unwrap();
    assert_eq!(err.code, codes::WRONG_ARG_TYPE);

    let err = Stage.create(&[]).err().unwrap();
    assert_eq!(err.code, codes::WRONG_ARG_COUNT);

    let err = Parallel.create(&[Val::Num(1.0)]).err().unwrap();
    assert_eq!(err.code, codes::WRONG_ARG_TYPE);

    let err = Env.create(&[Val::Null]).err().unwrap();
    assert_eq!(err.code, codes::WRONG_ARG_TYPE);
}

#[test]
fn test_display_names() {
    assert_eq!(Stage.display_name(&[Val::from("build")]), "Stage: build");
    assert_eq!(
        WaitForSignal::new(SignalBoard::new()).display_name(&[]),
        "Wait for signal 'signal'"
    );
    assert!(Stage.takes_body() && Stage.is_block());
    assert!(!Parallel.takes_body() && Parallel.is_block());
}

// ============================================================================
// Parallel
// ============================================================================

#[test]
fn test_parallel_without_branches_succeeds_immediately() {
    let ctx = StepContext::detached("parallel", None);
    let mut step = Parallel.create(&[]).unwrap();

    assert_eq!(step.start(&ctx), Ok(true));
    assert_eq!(ctx.outcome(), Some(Ok(Val::List(vec![]))));
}

#[test]
fn test_parallel_collects_results_in_branch_order() {
    let ctx = StepContext::detached("parallel", None);
    let mut step = Parallel
        .create(&[closure("return 1"), closure("return 2")])
        .unwrap();

    assert_eq!(step.start(&ctx), Ok(false));
    let bodies = ctx.drain_bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0].branch.as_deref(), Some("Branch: 1"));

    step.on_body_complete(&ctx, 1, Ok(Val::Num(2.0)));
    assert_eq!(ctx.outcome(), None);
    assert_eq!(step.status().as_deref(), Some("1 of 2 branches done"));

    step.on_body_complete(&ctx, 0, Ok(Val::Num(1.0)));
    assert_eq!(
        ctx.outcome(),
        Some(Ok(Val::List(vec![Val::Num(1.0), Val::Num(2.0)])))
    );
}

#[test]
fn test_parallel_fails_if_any_branch_fails() {
    let ctx = StepContext::detached("parallel", None);
    let mut step = Parallel
        .create(&[closure("return 1"), closure("return 2")])
        .unwrap();
    step.start(&ctx).unwrap();

    step.on_body_complete(&ctx, 0, Err(Failure::new(codes::STEP_FAILED, "a")));
    step.on_body_complete(&ctx, 1, Ok(Val::Null));

    let Some(Err(failure)) = ctx.outcome() else {
        panic!("parallel should fail");
    };
    assert_eq!(failure.message, "a");
}

#[test]
fn test_parallel_state_survives_resume() {
    let ctx = StepContext::detached("parallel", None);
    let args = vec![closure("return 1"), closure("return 2")];
    let mut step = Parallel.create(&args).unwrap();
    step.start(&ctx).unwrap();
    step.on_body_complete(&ctx, 0, Ok(Val::Num(1.0)));

    let mut resumed = Parallel.resume(&args, step.save_state()).unwrap();
    resumed.on_body_complete(&ctx, 1, Ok(Val::Num(2.0)));
    assert_eq!(
        ctx.outcome(),
        Some(Ok(Val::List(vec![Val::Num(1.0), Val::Num(2.0)])))
    );
}

// ============================================================================
// Signals & Timers
// ============================================================================

#[test]
fn test_signal_delivery() {
    let board = SignalBoard::new();
    let ctx = StepContext::detached("wait_for_signal", None);
    let mut step = WaitForSignal::new(board.clone())
        .create(&[Val::from("go")])
        .unwrap();

    assert_eq!(step.start(&ctx), Ok(false));
    assert!(board.is_waiting("go"));
    assert!(!board.is_waiting("signal"));

    assert!(board.deliver("go", Val::Num(5.0)));
    assert_eq!(ctx.outcome(), Some(Ok(Val::Num(5.0))));
    assert!(!board.deliver("go", Val::Null));
}

#[test]
fn test_stopped_waiter_leaves_the_board() {
    let board = SignalBoard::new();
    let ctx = StepContext::detached("wait_for_signal", None);
    let mut step = WaitForSignal::new(board.clone()).create(&[]).unwrap();
    step.start(&ctx).unwrap();

    assert_ok!(step.stop(&ctx, &Failure::interrupted("stop")));
    assert!(!board.is_waiting("signal"));
    assert!(matches!(ctx.outcome(), Some(Err(ref f)) if f.is_interrupted()));
}

fn waiter_at(node: u64) -> StepContext {
    StepContext::new(
        NodeId(node),
        ThreadId(node as u32),
        "wait_for_signal",
        None,
        BTreeMap::new(),
        Weak::new(),
    )
}

#[test]
fn test_waiters_on_one_name_are_served_in_order() {
    let board = SignalBoard::new();
    let first = waiter_at(3);
    let second = waiter_at(7);
    let mut steps = Vec::new();
    for ctx in [&first, &second] {
        let mut step = WaitForSignal::new(board.clone())
            .create(&[Val::from("s")])
            .unwrap();
        step.start(ctx).unwrap();
        steps.push(step);
    }
    assert_eq!(board.waiting("s"), 2);

    assert!(board.deliver("s", Val::from("one")));
    assert_eq!(first.outcome(), Some(Ok(Val::from("one"))));
    assert_eq!(second.outcome(), None);

    assert!(board.deliver("s", Val::from("two")));
    assert_eq!(second.outcome(), Some(Ok(Val::from("two"))));
    assert!(!board.is_waiting("s"));
}

#[test]
fn test_stopping_one_waiter_keeps_the_other() {
    let board = SignalBoard::new();
    let first = waiter_at(3);
    let second = waiter_at(7);
    let mut a = WaitForSignal::new(board.clone()).create(&[Val::from("s")]).unwrap();
    let mut b = WaitForSignal::new(board.clone()).create(&[Val::from("s")]).unwrap();
    a.start(&first).unwrap();
    b.start(&second).unwrap();

    assert_ok!(a.stop(&first, &Failure::interrupted("stop")));
    assert_eq!(board.waiting("s"), 1);
    assert!(board.deliver("s", Val::Null));
    assert_eq!(second.outcome(), Some(Ok(Val::Null)));
}

#[tokio::test]
async fn test_wait_for_waiter() {
    let board = SignalBoard::new();
    assert!(!board.wait_for_waiter("late", Duration::from_millis(20)).await);

    let registering = board.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ctx = StepContext::detached("wait_for_signal", None);
        let mut step = WaitForSignal::new(registering)
            .create(&[Val::from("late")])
            .unwrap();
        step.start(&ctx).unwrap();
        // Keep the step alive long enough to be seen
        tokio::time::sleep(Duration::from_millis(200)).await;
    });
    assert!(board.wait_for_waiter("late", Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_sleep_completes_later() {
    let ctx = StepContext::detached("sleep", None);
    let mut step = Sleep.create(&[Val::Num(10.0)]).unwrap();

    assert_eq!(step.start(&ctx), Ok(false));
    assert!(step.status().unwrap().starts_with("sleeping until"));
    assert_eq!(ctx.outcome(), None);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.outcome(), Some(Ok(Val::Null)));
}

#[tokio::test]
async fn test_stopped_sleep_fails_with_cause() {
    let ctx = StepContext::detached("sleep", None);
    let mut step = Sleep.create(&[Val::Num(60_000.0)]).unwrap();
    step.start(&ctx).unwrap();

    assert_ok!(step.stop(&ctx, &Failure::interrupted("enough")));
    let Some(Err(failure)) = ctx.outcome() else {
        panic!("sleep should fail after stop");
    };
    assert_eq!(failure.message, "enough");
}

#[test]
fn test_sleep_rejects_durations_out_of_range() {
    for ms in [1e18, f64::INFINITY, f64::NAN] {
        let failure = Sleep.create(&[Val::Num(ms)]).err().expect("should be rejected");
        assert_eq!(failure.code, codes::WRONG_ARG_TYPE);
    }
    assert!(Sleep.create(&[Val::Num(-5.0)]).is_ok());
}
