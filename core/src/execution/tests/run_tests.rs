//! Running scripts to completion

use std::sync::Arc;

use super::helpers::*;
use crate::config::EngineConfig;
use crate::engine::{AllowList, StepContext, StepDescriptor, StepExecution};
use crate::error::{codes, Failure};
use crate::execution::{LoadState, StartOptions};
use crate::flow::{FlowResult, NodeKind, StorageKind};
use crate::script::Val;

// ============================================================================
// Straight-Line Scripts
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_synchronous_steps_share_one_thread() {
    let h = Harness::new();
    let (execution, log) = h.start("x = instant(5)\necho(x)");

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert_eq!(execution.threads_created(), 1);
    assert!(log.contains("5"));
    assert!(log.contains("Finished: SUCCESS"));

    let calls = execution.internal_calls();
    assert_eq!(calls.get("instant"), Some(&1));
    assert_eq!(calls.get("echo"), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_ends_in_single_end_node() {
    let h = Harness::new();
    let (execution, _log) = h.start("echo('a')\necho('b')");
    finish(&execution).await;

    let heads = execution.current_heads();
    assert_eq!(heads.len(), 1);
    assert!(matches!(heads[0].kind, NodeKind::FlowEnd { .. }));

    let nodes = execution.nodes().unwrap();
    assert!(matches!(nodes[0].kind, NodeKind::FlowStart));
    let echoes: Vec<_> = nodes
        .iter()
        .filter(|n| n.function_name.as_deref() == Some("echo"))
        .collect();
    assert_eq!(echoes.len(), 2);
    assert_eq!(echoes[1].parents, vec![echoes[0].id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_migrates_to_bulk_on_completion() {
    let h = Harness::new();
    let (execution, _log) = h.start("echo('hi')");
    finish(&execution).await;

    assert_eq!(execution.record().storage, StorageKind::Bulk);
    assert!(execution.record().clean);
    assert!(h.root().join("nodes.json").exists());
    assert!(!execution.nodes().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_that_does_not_compile_fails() {
    let h = Harness::new();
    let (execution, log) = h.start("let = ");

    assert_eq!(finish(&execution).await, FlowResult::Failure);
    assert_eq!(execution.error().unwrap().code, codes::SCRIPT_ERROR);
    assert_eq!(execution.threads_created(), 0);
    assert!(log.contains("Finished: FAILURE"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_is_rejected() {
    let h = Harness::new();
    let (execution, _log) = h.start("echo('once')");
    assert!(execution.start().is_err());
    finish(&execution).await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uncaught_failure_in_body_fails_the_run() {
    let h = Harness::new();
    let (execution, _log) = h.start("stage('s') { error('boom') }\necho('unreachable')");

    assert_eq!(finish(&execution).await, FlowResult::Failure);
    let error = execution.error().unwrap();
    assert_eq!(error.code, codes::STEP_FAILED);
    assert_eq!(error.message, "boom");

    let stage_end = execution
        .nodes()
        .unwrap()
        .into_iter()
        .find(|n| matches!(n.kind, NodeKind::BlockEnd { .. }))
        .expect("the stage block is closed");
    assert_eq!(stage_end.error.unwrap().message, "boom");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_step_failures_are_catchable() {
    let h = Harness::new();
    let (execution, log) = h.start("try { error('x') } catch (e) { echo('caught') }");

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("caught"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_step_fails_the_call() {
    let h = Harness::new();
    let (execution, _log) = h.start("no_such_step(1)");

    assert_eq!(finish(&execution).await, FlowResult::Failure);
    assert_eq!(execution.error().unwrap().code, codes::NO_SUCH_STEP);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_step_without_body_fails() {
    let h = Harness::new();
    let (execution, _log) = h.start("try { stage('s') } catch (e) { echo(e) }");

    assert_eq!(finish(&execution).await, FlowResult::Success);
}

// ============================================================================
// Misbehaving Steps
// ============================================================================

/// `panicky()` panics as soon as it starts
struct Panicky;

struct PanickyExecution;

impl StepDescriptor for Panicky {
    fn function_name(&self) -> &str {
        "panicky"
    }

    fn create(&self, _args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(PanickyExecution))
    }
}

impl StepExecution for PanickyExecution {
    fn start(&mut self, _ctx: &StepContext) -> Result<bool, Failure> {
        panic!("wires crossed");
    }
}

/// `hasty()` claims to be done without delivering anything
struct Hasty;

struct HastyExecution;

impl StepDescriptor for Hasty {
    fn function_name(&self) -> &str {
        "hasty"
    }

    fn create(&self, _args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(HastyExecution))
    }
}

impl StepExecution for HastyExecution {
    fn start(&mut self, _ctx: &StepContext) -> Result<bool, Failure> {
        Ok(true)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sleep_out_of_range_fails_only_the_call() {
    let h = Harness::new();
    let (execution, log) = h.start(
        "try { sleep(1000000000000000000) } catch (e) { echo('caught') }\necho('after')",
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("caught"));
    assert!(log.contains("after"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_step_fails_only_its_call() {
    let h = Harness::new();
    let engine = h.builder().step(Panicky).build();
    let (execution, log) = h.start_with(
        engine,
        "try { panicky() } catch (e) { echo('caught') }\necho('after')",
        StartOptions::default(),
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("caught"));
    assert!(log.contains("after"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_step_failure_is_a_step_failure() {
    let h = Harness::new();
    let engine = h.builder().step(Panicky).build();
    let (execution, _log) = h.start_with(engine, "panicky()", StartOptions::default());

    assert_eq!(finish(&execution).await, FlowResult::Failure);
    let error = execution.error().unwrap();
    assert_eq!(error.code, codes::STEP_FAILED);
    assert!(error.message.contains("wires crossed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_without_outcome_fails_the_call() {
    let h = Harness::new();
    let engine = h.builder().step(Hasty).build();
    let (execution, _log) = h.start_with(engine, "hasty()", StartOptions::default());

    assert_eq!(finish(&execution).await, FlowResult::Failure);
    assert_eq!(execution.error().unwrap().code, codes::INTERNAL);
}

// ============================================================================
// Bodies
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_branches_run_in_order_of_creation() {
    let h = Harness::new();
    let (execution, log) = h.start(
        "parallel({ echo('a1')\necho('a2') }, { echo('b1')\necho('b2') })\necho('after')",
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    let lines: Vec<_> = log
        .lines()
        .into_iter()
        .filter(|l| ["a1", "a2", "b1", "b2", "after"].contains(&l.as_str()))
        .collect();
    assert_eq!(lines, vec!["a1", "a2", "b1", "b2", "after"]);
    assert_eq!(execution.threads_created(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_end_joins_branch_tips() {
    let h = Harness::new();
    let (execution, _log) = h.start("parallel({ echo('a') }, { echo('b') })");
    finish(&execution).await;

    let parallel = node_named(&execution, "Execute in parallel");
    let nodes = execution.nodes().unwrap();
    let end = nodes
        .iter()
        .find(|n| matches!(n.kind, NodeKind::BlockEnd { start } if start == parallel.id))
        .expect("parallel block end");
    assert_eq!(end.parents.len(), 2);

    let branch = node_named(&execution, "Branch: 1");
    assert_eq!(branch.parents, vec![parallel.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_result_is_a_list() {
    let h = Harness::new();
    let (execution, log) = h.start("r = parallel({ return instant(1) }, { return instant(2) })\necho(r)");

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("[1, 2]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pure_body_runs_without_a_new_thread() {
    let h = Harness::new();
    let (execution, log) = h.start("x = evaluate('lib', 'return 40 + 2')\necho(x)");

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("42"));
    assert_eq!(execution.threads_created(), 1);
    assert_eq!(
        execution.loaded_scripts().get("lib").map(String::as_str),
        Some("return 40 + 2")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_body_sees_contextual_variables() {
    let h = Harness::new();
    let (execution, log) = h.start(
        "with_context('region', 'eu') { echo('in ' + env('region')) }\necho('out ' + env('region'))",
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("in eu"));
    assert!(log.contains("out null"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closures_capture_by_value() {
    let h = Harness::new();
    let (execution, log) = h.start("let n = 1\nlet f = { echo('n=' + n) }\nn = 2\nparallel(f)");

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("n=1"));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signal_deliveries() {
    const BRANCHES: usize = 20;
    let h = Harness::new();
    let branches: Vec<String> = (0..BRANCHES)
        .map(|i| format!("{{ wait_for_signal('s{}') }}", i))
        .collect();
    let (execution, _log) = h.start(&format!("parallel({})", branches.join(", ")));

    for i in 0..BRANCHES {
        h.wait_for_signal(&format!("s{}", i)).await;
    }
    let deliveries: Vec<_> = (0..BRANCHES)
        .map(|i| {
            let board = h.board.clone();
            tokio::spawn(async move { board.deliver(&format!("s{}", i), Val::Num(i as f64)) })
        })
        .collect();
    for delivery in deliveries {
        assert!(delivery.await.unwrap());
    }

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert_eq!(execution.threads_created() as usize, BRANCHES + 1);
    assert_eq!(
        execution.internal_calls().get("wait_for_signal"),
        Some(&(BRANCHES as u64))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_branches_waiting_on_the_same_signal() {
    let h = Harness::new();
    let (execution, log) = h.start(
        "r = parallel({ return wait_for_signal('s') }, { return wait_for_signal('s') })\necho(r)",
    );
    tokio::time::timeout(WAIT, async {
        while h.board.waiting("s") < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both branches should wait");

    assert!(h.board.deliver("s", Val::from("x")));
    assert!(h.board.deliver("s", Val::from("y")));
    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("[x, y]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_loop_does_not_starve_other_branches() {
    let config = EngineConfig {
        safepoint_budget: 50,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    let (execution, log) = h.start(
        "parallel({ let i = 0\nwhile (i < 2000) { i = i + 1 }\necho('spun') }, { echo('quick') })",
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    let lines = log.lines();
    let quick = lines.iter().position(|l| l == "quick").unwrap();
    let spun = lines.iter().position(|l| l == "spun").unwrap();
    assert!(quick < spun);
}

// ============================================================================
// Diagnostics
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_dump_of_waiting_step() {
    let h = Harness::new();
    let (execution, _log) = h.start("echo('first')\nwait_for_signal('x')");
    h.wait_for_signal("x").await;

    let dump = execution.thread_dump().await.unwrap();
    assert_eq!(dump.threads.len(), 1);
    let thread = &dump.threads[0];
    assert!(!thread.runnable);
    let step = thread.step.as_ref().expect("thread is in a step");
    assert_eq!(step.display_name, "Wait for signal 'x'");
    assert_eq!(step.status.as_deref(), Some("waiting for signal 'x'"));
    assert_eq!(thread.frames[0].line, 2);
    assert!(dump.to_string().contains("Wait for signal 'x'"));

    h.board.deliver("x", Val::Null);
    finish(&execution).await;
    assert!(execution.thread_dump().await.unwrap().threads.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_current_executions_innermost() {
    let h = Harness::new();
    let (execution, _log) = h.start("stage('outer') { wait_for_signal() }");
    h.wait_for_signal("signal").await;

    let all = execution.current_executions(false).await.unwrap();
    let names: Vec<_> = all.iter().map(|s| s.function.as_str()).collect();
    assert_eq!(names, vec!["stage", "wait_for_signal"]);

    let innermost = execution.current_executions(true).await.unwrap();
    assert_eq!(innermost.len(), 1);
    assert_eq!(innermost[0].function, "wait_for_signal");

    h.board.deliver("signal", Val::Null);
    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(execution.current_executions(false).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_state_progresses_to_finished() {
    let h = Harness::new();
    let (execution, _log) = h.start("wait_for_signal()");
    assert_eq!(execution.load_state(), LoadState::Ready);
    assert!(execution.is_resumable());

    h.wait_for_signal("signal").await;
    h.board.deliver("signal", Val::Null);
    finish(&execution).await;
    assert_eq!(execution.load_state(), LoadState::Finished);
    assert!(execution.is_complete());
}

// ============================================================================
// Sandbox
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandboxed_script_cannot_call_unlisted_steps() {
    let h = Harness::new();
    let engine = h
        .builder()
        .sandbox(Arc::new(AllowList::new(["echo"])))
        .build();
    let options = StartOptions {
        sandbox: Some(true),
        ..Default::default()
    };
    let (execution, log) = h.start_with(
        engine,
        "try { instant(1) } catch (e) { echo('blocked') }",
        options,
    );

    assert_eq!(finish(&execution).await, FlowResult::Success);
    assert!(log.contains("blocked"));
    assert_eq!(execution.internal_calls().get("instant"), None);
    assert!(execution.record().sandbox);
}
