//! Interrupts and scoped cancellation

use std::sync::Arc;
use std::time::Duration;

use super::helpers::*;
use crate::config::EngineConfig;
use crate::engine::{StepContext, StepDescriptor, StepExecution};
use crate::error::{codes, Failure};
use crate::execution::{FlowExecution, LoadState};
use crate::flow::{FlowResult, NodeKind};
use crate::script::Val;

/// `stubborn()` never completes and takes a while to stop
struct Stubborn;

struct StubbornExecution;

impl StepDescriptor for Stubborn {
    fn function_name(&self) -> &str {
        "stubborn"
    }

    fn create(&self, _args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(StubbornExecution))
    }
}

impl StepExecution for StubbornExecution {
    fn start(&mut self, _ctx: &StepContext) -> Result<bool, Failure> {
        Ok(false)
    }

    fn stop(&mut self, _ctx: &StepContext, _cause: &Failure) -> Result<(), Failure> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(())
    }
}

// ============================================================================
// Interrupt
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_stops_running_step() {
    let h = Harness::new();
    let (execution, log) = h.start("sleep(60000)\necho('unreachable')");
    tokio::time::timeout(WAIT, async {
        while execution.current_executions(true).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sleep should start");

    execution
        .interrupt(FlowResult::Aborted, vec![Failure::new("UserCancel", "by alice")])
        .await
        .unwrap();

    assert_eq!(finish(&execution).await, FlowResult::Aborted);
    assert!(!log.contains("unreachable"));
    assert!(log.contains("Interrupted: interrupted with ABORTED"));
    assert_eq!(execution.record().causes.len(), 1);
    assert!(execution.error().unwrap().is_interrupted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_reaches_thread_between_steps() {
    let config = EngineConfig {
        safepoint_budget: 20,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    let (execution, _log) = h.start("let i = 0\nwhile (true) { i = i + 1 }");
    tokio::time::sleep(Duration::from_millis(50)).await;

    execution.interrupt(FlowResult::Aborted, Vec::new()).await.unwrap();
    assert_eq!(finish(&execution).await, FlowResult::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_can_be_caught() {
    let h = Harness::new();
    let (execution, log) = h.start("try { wait_for_signal() } catch (e) { echo('cleanup') }");
    h.wait_for_signal("signal").await;

    execution.interrupt(FlowResult::NotBuilt, Vec::new()).await.unwrap();
    // The script handled it, but the requested result still counts
    assert_eq!(finish(&execution).await, FlowResult::NotBuilt);
    assert!(log.contains("cleanup"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_timeout_fails_the_step_anyway() {
    let config = EngineConfig {
        stop_timeout_ms: 50,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    let engine = h.builder().step(Stubborn).build();
    let (execution, _log) = h.start_with(engine, "stubborn()", Default::default());
    tokio::time::timeout(WAIT, async {
        while execution.current_executions(true).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stubborn should start");

    execution.interrupt(FlowResult::Aborted, Vec::new()).await.unwrap();
    assert_eq!(finish(&execution).await, FlowResult::Aborted);

    let error = execution.error().unwrap();
    assert!(error.is_interrupted());
    assert!(error
        .suppressed
        .iter()
        .any(|s| s.code == codes::STOP_TIMEOUT));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_after_completion_is_a_no_op() {
    let h = Harness::new();
    let (execution, _log) = h.start("echo('done')");
    finish(&execution).await;

    execution.interrupt(FlowResult::Aborted, Vec::new()).await.unwrap();
    assert_eq!(execution.result(), Some(FlowResult::Success));
}

// ============================================================================
// Scoped Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_scope_stops_only_that_branch() {
    let h = Harness::new();
    let (execution, _log) =
        h.start("parallel({ wait_for_signal('a') }, { wait_for_signal('b') })");
    h.wait_for_signal("a").await;
    h.wait_for_signal("b").await;

    let branch = node_named(&execution, "Branch: 1");
    execution
        .cancel_scope(branch.id, Failure::interrupted("cancel branch one"))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while h.board.is_waiting("a") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("branch one should stop");
    assert!(h.board.is_waiting("b"));
    assert!(!execution.is_complete());

    h.board.deliver("b", Val::Null);
    assert_eq!(finish(&execution).await, FlowResult::Aborted);

    let branch_end = execution
        .nodes()
        .unwrap()
        .into_iter()
        .find(|n| matches!(n.kind, NodeKind::BlockEnd { start } if start == branch.id))
        .expect("branch one was closed");
    assert_eq!(branch_end.error.unwrap().message, "cancel branch one");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_scope_outside_running_steps_does_nothing() {
    let h = Harness::new();
    let (execution, _log) = h.start("stage('one') { echo('x') }\nwait_for_signal()");
    h.wait_for_signal("signal").await;

    let stage = node_named(&execution, "Stage: one");
    execution
        .cancel_scope(stage.id, Failure::interrupted("too late"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.board.is_waiting("signal"));

    h.board.deliver("signal", Val::Null);
    assert_eq!(finish(&execution).await, FlowResult::Success);
}

// ============================================================================
// During Load
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_while_loading_cancels_the_load() {
    let h = Harness::new();
    let (execution, _log) = h.start("c = connect('db')\nwait_for_signal()");
    h.wait_for_signal("signal").await;
    FlowExecution::suspend_all(&[Arc::clone(&execution)]).await;

    let engine = h
        .builder()
        .pickle_resolver("conn", Arc::new(StuckResolver))
        .build();
    let loaded = FlowExecution::load(engine, h.owner()).await.unwrap();

    let dump = tokio::time::timeout(WAIT, async {
        loop {
            let dump = loaded.thread_dump().await.unwrap();
            if !dump.pending_pickles.is_empty() {
                return dump;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("load should wait on the pickle");
    assert_eq!(loaded.load_state(), LoadState::Loading);
    assert_eq!(dump.pending_pickles[0].key, "db");
    assert!(dump.to_string().contains("conn:db"));

    loaded.interrupt(FlowResult::Aborted, Vec::new()).await.unwrap();
    assert_eq!(finish(&loaded).await, FlowResult::Aborted);
}
