//! Execution engine
//!
//! Threads run script continuations; steps are the external work those
//! continuations suspend on. A `ThreadGroup` schedules the threads of one
//! execution on that execution's lane.

pub mod context;
pub mod continuation;
pub mod dump;
pub mod group;
pub mod lane;
pub mod pickle;
pub mod sandbox;
pub mod step;
pub mod thread;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::script::ScriptEngine;

pub use context::{BodyInvoker, StepContext};
pub use continuation::{BodyCall, Continuable, Outcome, ScriptRuntime, StackFrame, StepRequest, Yield};
pub use dump::{StepExecutionInfo, ThreadDump, ThreadInfo};
pub use group::{ProgramSnapshot, ThreadGroup};
pub use lane::LaneHandle;
pub use pickle::{Pickle, PickleRegistry, PickleResolver};
pub use sandbox::{AllowList, SandboxPolicy, SandboxedContinuable};
pub use step::{StepDescriptor, StepExecution, StepRegistry};
pub use thread::ThreadId;

/* ===================== Engine ===================== */

struct EngineInner {
    config: EngineConfig,
    runtime: Arc<dyn ScriptRuntime>,
    steps: StepRegistry,
    pickles: PickleRegistry,
    sandbox: Option<Arc<dyn SandboxPolicy>>,
}

/// Shared services for executions: configuration, script runtime, steps and resolvers
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> Arc<dyn ScriptRuntime> {
        Arc::clone(&self.inner.runtime)
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.inner.steps
    }

    pub fn pickles(&self) -> &PickleRegistry {
        &self.inner.pickles
    }

    pub fn sandbox(&self) -> Option<Arc<dyn SandboxPolicy>> {
        self.inner.sandbox.clone()
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    runtime: Option<Arc<dyn ScriptRuntime>>,
    steps: StepRegistry,
    pickles: PickleRegistry,
    sandbox: Option<Arc<dyn SandboxPolicy>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            runtime: None,
            steps: StepRegistry::new(),
            pickles: PickleRegistry::new(),
            sandbox: None,
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn ScriptRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn step(mut self, descriptor: impl StepDescriptor + 'static) -> Self {
        self.steps.insert(Arc::new(descriptor));
        self
    }

    pub fn pickle_resolver(mut self, kind: impl Into<String>, resolver: Arc<dyn PickleResolver>) -> Self {
        self.pickles.register(kind, resolver);
        self
    }

    /// Policy applied to executions started with sandboxing on
    pub fn sandbox(mut self, policy: Arc<dyn SandboxPolicy>) -> Self {
        self.sandbox = Some(policy);
        self
    }

    pub fn build(self) -> Engine {
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(ScriptEngine::new(self.config.safepoint_budget)));
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                runtime,
                steps: self.steps,
                pickles: self.pickles,
                sandbox: self.sandbox,
            }),
        }
    }
}
