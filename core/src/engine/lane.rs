//! Single-lane worker
//!
//! Each execution gets one tokio task that owns its `ThreadGroup`. Every
//! mutation of the group arrives as a message on the lane's channel, so at most
//! one scheduler loop runs for an execution at any time.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use super::group::ThreadGroup;
use crate::error::{EngineError, EngineResult, Failure};
use crate::execution::FlowExecution;

/// Work run on the lane with exclusive access to the thread group
pub type Job = Box<dyn FnOnce(&mut ThreadGroup) + Send>;

pub enum LaneMessage {
    Job(Job),
    /// Run the scheduler loop; the sender fires when that run is over
    Run(Option<oneshot::Sender<()>>),
    Shutdown,
}

#[derive(Clone)]
pub struct LaneHandle {
    tx: mpsc::UnboundedSender<LaneMessage>,
}

pub(crate) type LaneReceiver = mpsc::UnboundedReceiver<LaneMessage>;

pub(crate) fn channel() -> (LaneHandle, LaneReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LaneHandle { tx }, rx)
}

impl LaneHandle {
    pub fn submit(&self, job: Job) -> EngineResult<()> {
        self.tx
            .send(LaneMessage::Job(job))
            .map_err(|_| EngineError::LaneClosed)
    }

    /// Run a job on the lane and wait for its result
    pub async fn query<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ThreadGroup) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |group| {
            let _ = tx.send(f(group));
        }))?;
        rx.await.map_err(|_| EngineError::LaneClosed)
    }

    /// Ask for a scheduler run; requests arriving together share one run
    pub fn schedule_run(&self) -> EngineResult<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LaneMessage::Run(Some(tx)))
            .map_err(|_| EngineError::LaneClosed)?;
        Ok(rx)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(LaneMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Serve the lane until shutdown or program completion
pub(crate) async fn serve(mut group: ThreadGroup, mut inbox: LaneReceiver) {
    let execution = group.execution();
    let span = tracing::info_span!("lane", execution = %execution.id());

    async move {
        while let Some(message) = inbox.recv().await {
            let result = AssertUnwindSafe(async { turn(&mut group, &mut inbox, message) })
                .catch_unwind()
                .await;
            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(panic) => {
                    let message = panic_message(&*panic);
                    tracing::error!(panic = %message, "Scheduler lane panicked");
                    execution.croak(Failure::internal(format!(
                        "scheduler failure: {}",
                        message
                    )));
                    break;
                }
            }
        }
        execution.set_busy(false);
        tracing::debug!("Lane stopped");
    }
    .instrument(span)
    .await
}

/// Handle one message plus everything queued behind it, then run the loop
///
/// Returns false once the lane should stop.
fn turn(group: &mut ThreadGroup, inbox: &mut LaneReceiver, first: LaneMessage) -> bool {
    let execution = group.execution();
    execution.set_busy(true);

    let mut waiters = Vec::new();
    let mut keep_going = handle(group, first, &mut waiters) && drain(group, inbox, &mut waiters);
    if keep_going {
        keep_going = group.run(inbox, &mut waiters);
    }
    execution.set_busy(false);

    for waiter in waiters {
        let _ = waiter.send(());
    }
    keep_going && !group.is_finished()
}

fn handle(
    group: &mut ThreadGroup,
    message: LaneMessage,
    waiters: &mut Vec<oneshot::Sender<()>>,
) -> bool {
    match message {
        LaneMessage::Job(job) => {
            job(group);
            true
        }
        LaneMessage::Run(waiter) => {
            waiters.extend(waiter);
            true
        }
        LaneMessage::Shutdown => false,
    }
}

/// Apply everything queued on the lane without blocking
///
/// Run requests join the loop already in progress. Returns false on shutdown.
pub(crate) fn drain(
    group: &mut ThreadGroup,
    inbox: &mut LaneReceiver,
    waiters: &mut Vec<oneshot::Sender<()>>,
) -> bool {
    while let Ok(message) = inbox.try_recv() {
        if !handle(group, message, waiters) {
            return false;
        }
    }
    true
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn the lane task for a group
pub(crate) fn spawn(
    execution: &Arc<FlowExecution>,
    group: ThreadGroup,
    inbox: LaneReceiver,
) -> tokio::task::JoinHandle<()> {
    execution.runtime().spawn(serve(group, inbox))
}
