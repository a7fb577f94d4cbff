//! Thread dumps and step listings

use serde::{Deserialize, Serialize};
use std::fmt;

use super::continuation::StackFrame;
use super::pickle::Pickle;
use super::thread::ThreadId;
use crate::flow::{HeadId, NodeId};

/// A running step, as listed by `current_executions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionInfo {
    pub node: NodeId,
    pub thread: ThreadId,
    pub function: String,
    pub display_name: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub head: HeadId,
    pub runnable: bool,
    pub alive: bool,
    pub step: Option<StepExecutionInfo>,
    pub frames: Vec<StackFrame>,
}

/// Point-in-time view of every thread
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadDump {
    pub threads: Vec<ThreadInfo>,
    /// Pickles still resolving, when taken during a load
    pub pending_pickles: Vec<Pickle>,
}

impl ThreadDump {
    pub fn loading(pending_pickles: Vec<Pickle>) -> Self {
        Self {
            threads: Vec::new(),
            pending_pickles,
        }
    }
}

impl fmt::Display for ThreadDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.pending_pickles.is_empty() {
            writeln!(f, "Program is loading, waiting on:")?;
            for pickle in &self.pending_pickles {
                writeln!(f, "    {}", pickle)?;
            }
        }
        for thread in &self.threads {
            let state = if thread.runnable {
                "runnable"
            } else if thread.alive {
                "waiting"
            } else {
                "finished"
            };
            writeln!(f, "Thread #{} (head {}): {}", thread.id, thread.head, state)?;
            if let Some(step) = &thread.step {
                write!(f, "    in {} (node {})", step.display_name, step.node)?;
                if let Some(status) = &step.status {
                    write!(f, ": {}", status)?;
                }
                writeln!(f)?;
            }
            for frame in &thread.frames {
                writeln!(f, "    {}", frame)?;
            }
        }
        Ok(())
    }
}
