//! Tests for threads, step contexts and the sandbox

use maplit::btreemap;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::thread::ExecThread;
use super::*;
use crate::error::{codes, EngineError, Failure};
use crate::flow::HeadId;
use crate::script::{ScriptEngine, Val};

// ============================================================================
// Helper Functions
// ============================================================================

fn thread(source: &str) -> ExecThread {
    let continuation = ScriptEngine::new(1_000)
        .compile("Script1", source)
        .expect("script should compile");
    ExecThread::new(ThreadId(1), continuation, HeadId(1), BTreeMap::new())
}

// ============================================================================
// Execution Thread
// ============================================================================

#[test]
fn test_runnable_iff_resume_pending() {
    let mut t = thread("instant(1)\nreturn 2");
    assert!(!t.is_runnable());

    t.resume(Ok(Val::Null)).unwrap();
    assert!(t.is_runnable());

    let yielded = t.advance().expect("thread has a continuation");
    assert!(matches!(yielded, Yield::Step(ref r) if r.function == "instant"));
    assert!(!t.is_runnable());
    assert!(t.is_alive());
}

#[test]
fn test_second_resume_fails_fast() {
    let mut t = thread("instant(1)");
    t.resume(Ok(Val::Null)).unwrap();

    let err = t.resume(Ok(Val::Null)).unwrap_err();
    assert!(matches!(err, EngineError::ResumeAlreadyPending(ThreadId(1))));
}

#[test]
fn test_resume_receiver_fires_when_consumed() {
    let mut t = thread("instant(1)");
    let mut consumed = t.resume(Ok(Val::Null)).unwrap();
    assert!(consumed.try_recv().is_err());

    t.advance();
    assert!(consumed.try_recv().is_ok());
}

#[test]
fn test_inject_overwrites_pending_value() {
    let mut t = thread("instant(1)");
    t.resume(Ok(Val::Null)).unwrap();
    t.inject(Failure::interrupted("stop"));

    match t.advance() {
        Some(Yield::Completed(Err(failure))) => assert!(failure.is_interrupted()),
        other => panic!("expected the injected failure, got {:?}", other),
    }
}

#[test]
fn test_retired_thread_has_placeholder_trace() {
    let mut t = thread("instant(1)");
    t.retire();

    assert!(!t.is_alive());
    assert!(!t.is_runnable());
    let frames = t.stack_trace();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].function, "<retired>");
}

#[test]
fn test_safepoint_parks_runnable() {
    let continuation = ScriptEngine::new(5)
        .compile("Script1", "let i = 0\nwhile (i < 100) { i = i + 1 }\nreturn i")
        .unwrap();
    let mut t = ExecThread::new(ThreadId(1), continuation, HeadId(1), BTreeMap::new());
    t.resume(Ok(Val::Null)).unwrap();

    assert_eq!(t.advance(), Some(Yield::Safepoint));
    t.park_at_safepoint();
    assert!(t.is_runnable());
}

#[test]
fn test_snapshot_round_trip_keeps_position() {
    let engine = ScriptEngine::new(1_000);
    let mut t = thread("let a = instant(1)\nreturn a + 1");
    t.resume(Ok(Val::Null)).unwrap();
    t.advance();
    t.resume(Ok(Val::Num(41.0))).unwrap();

    let snapshot = t.snapshot().unwrap().expect("live thread");
    let continuation = engine.restore(snapshot.continuation.clone()).unwrap();
    let mut restored = ExecThread::restore(snapshot, continuation);

    assert!(restored.is_runnable());
    assert_eq!(
        restored.advance(),
        Some(Yield::Completed(Ok(Val::Num(42.0))))
    );
}

#[test]
fn test_snapshot_keeps_contextual_variables() {
    let continuation = ScriptEngine::new(1_000)
        .compile("Script1", "instant(1)")
        .unwrap();
    let variables = btreemap! {
        "region".to_string() => Val::from("eu"),
        "attempt".to_string() => Val::Num(2.0),
    };
    let t = ExecThread::new(ThreadId(2), continuation, HeadId(3), variables.clone());

    let snapshot = t.snapshot().unwrap().expect("live thread");
    assert_eq!(snapshot.variables, variables);
    assert_eq!(snapshot.head, HeadId(3));
    assert_eq!(snapshot.step, None);
}

// ============================================================================
// Step Context
// ============================================================================

#[test]
fn test_success_then_failure_keeps_success() {
    let ctx = StepContext::detached("instant", None);
    ctx.on_success(Val::Num(1.0));
    ctx.on_failure(Failure::new(codes::STEP_FAILED, "late"));

    assert_eq!(ctx.outcome(), Some(Ok(Val::Num(1.0))));
    let suppressed = ctx.suppressed();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].message, "late");
}

#[test]
fn test_failure_then_failure_chains_suppressed() {
    let ctx = StepContext::detached("instant", None);
    ctx.on_failure(Failure::new(codes::STEP_FAILED, "first"));
    ctx.on_failure(Failure::new(codes::STEP_FAILED, "second"));

    let Some(Err(first)) = ctx.outcome() else {
        panic!("expected the first failure");
    };
    assert_eq!(first.message, "first");
    assert_eq!(first.suppressed.len(), 1);
    assert_eq!(first.suppressed[0].message, "second");
    assert_eq!(ctx.suppressed().len(), 1);
}

#[test]
fn test_switch_to_async_only_without_outcome() {
    let ctx = StepContext::detached("sleep", None);
    assert!(!ctx.is_async());
    assert!(ctx.switch_to_async());
    assert!(ctx.is_async());

    let done = StepContext::detached("instant", None);
    done.on_success(Val::Null);
    assert!(!done.switch_to_async());
    assert!(!done.is_async());
}

#[test]
fn test_consumed_outcome_is_hidden() {
    let ctx = StepContext::detached("instant", None);
    ctx.on_success(Val::Bool(true));

    assert_eq!(ctx.take_outcome_for_delivery(), Some(Ok(Val::Bool(true))));
    assert_eq!(ctx.outcome(), None);
    assert_eq!(ctx.take_outcome_for_delivery(), None);

    // Late deliveries still count as duplicates
    ctx.on_success(Val::Null);
    assert_eq!(ctx.suppressed().len(), 1);
}

#[test]
fn test_body_invoker_without_body_fails() {
    let ctx = StepContext::detached("stage", None);
    let err = ctx.new_body_invoker().err().expect("no body was given");
    assert!(matches!(err, EngineError::MissingBody(ref f) if f == "stage"));
}

#[test]
fn test_queued_bodies_get_increasing_indexes() {
    let ctx = StepContext::detached("stage", Some(7));
    let first = ctx.new_body_invoker().unwrap().start();
    let second = ctx
        .new_body_invoker()
        .unwrap()
        .with_context("k", Val::from("v"))
        .branch("Branch: 2")
        .start();

    assert_eq!((first, second), (0, 1));
    let bodies = ctx.drain_bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1].branch.as_deref(), Some("Branch: 2"));
    assert_eq!(bodies[1].overrides.get("k"), Some(&Val::from("v")));
    assert!(ctx.drain_bodies().is_empty());
}

// ============================================================================
// Sandbox
// ============================================================================

#[test]
fn test_sandbox_rejects_unlisted_steps() {
    let inner = ScriptEngine::new(1_000)
        .compile(
            "Script1",
            "try { error('x') } catch (e) { echo('caught') }\nreturn 1",
        )
        .unwrap();
    let policy: Arc<dyn SandboxPolicy> = Arc::new(AllowList::new(["echo"]));
    let mut sandboxed = SandboxedContinuable::new(inner, policy);

    match sandboxed.drive(Ok(Val::Null)) {
        Yield::Step(request) => assert_eq!(request.function, "echo"),
        other => panic!("expected the echo call, got {:?}", other),
    }
    assert_eq!(
        sandboxed.drive(Ok(Val::Null)),
        Yield::Completed(Ok(Val::Num(1.0)))
    );
}
