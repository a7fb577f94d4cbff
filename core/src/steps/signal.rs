//! `wait_for_signal(name?)` and the board signals are delivered through

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{check_arg_count, str_arg};
use crate::engine::{StepContext, StepDescriptor, StepExecution};
use crate::error::Failure;
use crate::flow::NodeId;
use crate::script::Val;

const DEFAULT_SIGNAL: &str = "signal";

/// Named waiters, shared between the steps and whoever delivers signals
///
/// Several steps may wait on one name; deliveries reach them in the order
/// they registered. A waiter registers again after a reload, so the board
/// does not need to be persisted.
#[derive(Clone, Default)]
pub struct SignalBoard {
    waiters: Arc<Mutex<BTreeMap<String, VecDeque<StepContext>>>>,
    changed: Arc<Notify>,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, ctx: StepContext) {
        {
            let mut waiters = self.waiters.lock();
            let queue = waiters.entry(name.to_string()).or_default();
            if !queue.iter().any(|w| w.node() == ctx.node()) {
                queue.push_back(ctx);
            }
        }
        self.changed.notify_waiters();
    }

    /// Remove the waiter for `name` that belongs to the step at `node`
    fn remove(&self, name: &str, node: NodeId) {
        let mut waiters = self.waiters.lock();
        if let Some(queue) = waiters.get_mut(name) {
            queue.retain(|ctx| ctx.node() != node);
            if queue.is_empty() {
                waiters.remove(name);
            }
        }
    }

    /// Oldest waiter for `name`
    fn take(&self, name: &str) -> Option<StepContext> {
        let mut waiters = self.waiters.lock();
        let queue = waiters.get_mut(name)?;
        let ctx = queue.pop_front();
        if queue.is_empty() {
            waiters.remove(name);
        }
        ctx
    }

    pub fn is_waiting(&self, name: &str) -> bool {
        self.waiting(name) > 0
    }

    /// Number of steps waiting for `name`
    pub fn waiting(&self, name: &str) -> usize {
        self.waiters.lock().get(name).map_or(0, VecDeque::len)
    }

    /// Complete the oldest waiter for `name`; false if nobody is waiting
    pub fn deliver(&self, name: &str, value: Val) -> bool {
        let Some(ctx) = self.take(name) else {
            return false;
        };
        tracing::debug!(signal = name, node = %ctx.node(), "Delivering signal");
        ctx.on_success(value);
        true
    }

    /// Fail the oldest waiter for `name`; false if nobody is waiting
    pub fn fail(&self, name: &str, failure: Failure) -> bool {
        let Some(ctx) = self.take(name) else {
            return false;
        };
        ctx.on_failure(failure);
        true
    }

    /// Wait until someone waits for `name`
    pub async fn wait_for_waiter(&self, name: &str, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if self.is_waiting(name) {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

pub struct WaitForSignal {
    board: SignalBoard,
}

impl WaitForSignal {
    pub fn new(board: SignalBoard) -> Self {
        Self { board }
    }

    fn signal_name(args: &[Val]) -> Result<String, Failure> {
        check_arg_count("wait_for_signal", args, 0, 1)?;
        if args.is_empty() {
            Ok(DEFAULT_SIGNAL.to_string())
        } else {
            str_arg("wait_for_signal", args, 0)
        }
    }
}

struct WaitExecution {
    name: String,
    board: SignalBoard,
}

impl StepDescriptor for WaitForSignal {
    fn function_name(&self) -> &str {
        "wait_for_signal"
    }

    fn display_name(&self, args: &[Val]) -> String {
        match Self::signal_name(args) {
            Ok(name) => format!("Wait for signal '{}'", name),
            Err(_) => "Wait for signal".to_string(),
        }
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(WaitExecution {
            name: Self::signal_name(args)?,
            board: self.board.clone(),
        }))
    }
}

impl StepExecution for WaitExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        self.board.register(&self.name, ctx.clone());
        Ok(false)
    }

    fn stop(&mut self, ctx: &StepContext, cause: &Failure) -> Result<(), Failure> {
        self.board.remove(&self.name, ctx.node());
        ctx.on_failure(cause.clone());
        Ok(())
    }

    fn on_resume(&mut self, ctx: &StepContext) {
        self.board.register(&self.name, ctx.clone());
    }

    fn status(&self) -> Option<String> {
        Some(format!("waiting for signal '{}'", self.name))
    }
}
