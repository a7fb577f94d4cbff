//! Step protocol: descriptors create executions, executions report through a context

use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::StepContext;
use super::continuation::Outcome;
use crate::error::Failure;
use crate::script::Val;

/// A step as seen by scripts: a function name and a factory
pub trait StepDescriptor: Send + Sync {
    fn function_name(&self) -> &str;

    /// Whether calls must carry a trailing block
    fn takes_body(&self) -> bool {
        false
    }

    /// Whether the step opens a block in the history graph
    fn is_block(&self) -> bool {
        self.takes_body()
    }

    fn display_name(&self, args: &[Val]) -> String {
        let _ = args;
        self.function_name().to_string()
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure>;

    /// Rebuild a running execution after a reload
    fn resume(
        &self,
        args: &[Val],
        state: Option<serde_json::Value>,
    ) -> Result<Box<dyn StepExecution>, Failure> {
        let _ = state;
        self.create(args)
    }
}

/// One running invocation of a step
pub trait StepExecution: Send {
    /// Begin work. Return `Ok(true)` if the outcome was already delivered
    /// through the context, `Ok(false)` if it will arrive later.
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure>;

    /// Cancel. The caller bounds this with a timeout.
    fn stop(&mut self, ctx: &StepContext, cause: &Failure) -> Result<(), Failure> {
        ctx.on_failure(cause.clone());
        Ok(())
    }

    /// Called once after the program was restored from disk
    fn on_resume(&mut self, ctx: &StepContext) {
        let _ = ctx;
    }

    /// A body started through a `BodyInvoker` finished
    fn on_body_complete(&mut self, ctx: &StepContext, index: usize, outcome: Outcome) {
        let _ = index;
        ctx.complete(outcome);
    }

    /// State to persist alongside the program
    fn save_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Short human-readable status for thread dumps
    fn status(&self) -> Option<String> {
        None
    }
}

/// Steps available to scripts, by function name
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: BTreeMap<String, Arc<dyn StepDescriptor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, descriptor: impl StepDescriptor + 'static) -> Self {
        self.insert(Arc::new(descriptor));
        self
    }

    pub fn insert(&mut self, descriptor: Arc<dyn StepDescriptor>) {
        self.steps
            .insert(descriptor.function_name().to_string(), descriptor);
    }

    pub fn get(&self, function: &str) -> Option<Arc<dyn StepDescriptor>> {
        self.steps.get(function).cloned()
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|k| k.as_str())
    }
}
