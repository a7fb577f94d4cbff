//! Steps that run script bodies

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{check_arg_count, str_arg};
use crate::engine::{Outcome, StepContext, StepDescriptor, StepExecution};
use crate::error::{codes, Failure};
use crate::script::{Closure, Val};

/// Start the step's trailing block with optional contextual variables
fn start_block(ctx: &StepContext, variables: BTreeMap<String, Val>) -> Result<bool, Failure> {
    let mut invoker = ctx.new_body_invoker().map_err(Failure::from)?;
    for (key, value) in variables {
        invoker = invoker.with_context(key, value);
    }
    invoker.start();
    Ok(false)
}

/* ===================== stage ===================== */

/// `stage(name) { body }`
pub struct Stage;

struct StageExecution;

impl StepDescriptor for Stage {
    fn function_name(&self) -> &str {
        "stage"
    }

    fn takes_body(&self) -> bool {
        true
    }

    fn display_name(&self, args: &[Val]) -> String {
        match args.first() {
            Some(name) => format!("Stage: {}", name),
            None => "Stage".to_string(),
        }
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("stage", args, 1, 1)?;
        str_arg("stage", args, 0)?;
        Ok(Box::new(StageExecution))
    }
}

impl StepExecution for StageExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        start_block(ctx, BTreeMap::new())
    }
}

/* ===================== with_context ===================== */

/// `with_context(key, value) { body }` - `env(key)` inside the body sees `value`
pub struct WithContext;

struct WithContextExecution {
    key: String,
    value: Val,
}

impl StepDescriptor for WithContext {
    fn function_name(&self) -> &str {
        "with_context"
    }

    fn takes_body(&self) -> bool {
        true
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("with_context", args, 2, 2)?;
        Ok(Box::new(WithContextExecution {
            key: str_arg("with_context", args, 0)?,
            value: args[1].clone(),
        }))
    }
}

impl StepExecution for WithContextExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        let mut variables = BTreeMap::new();
        variables.insert(self.key.clone(), self.value.clone());
        start_block(ctx, variables)
    }
}

/* ===================== parallel ===================== */

/// `parallel(closure, ...)` - run each closure on its own branch and wait for all
pub struct Parallel;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ParallelState {
    results: BTreeMap<usize, Outcome>,
}

struct ParallelExecution {
    branches: Vec<Closure>,
    state: ParallelState,
}

impl Parallel {
    fn closures(args: &[Val]) -> Result<Vec<Closure>, Failure> {
        args.iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.as_closure().cloned().ok_or_else(|| {
                    Failure::new(
                        codes::WRONG_ARG_TYPE,
                        format!(
                            "parallel: argument {} must be a closure, got {}",
                            i + 1,
                            arg.type_name()
                        ),
                    )
                })
            })
            .collect()
    }
}

impl StepDescriptor for Parallel {
    fn function_name(&self) -> &str {
        "parallel"
    }

    fn is_block(&self) -> bool {
        true
    }

    fn display_name(&self, _args: &[Val]) -> String {
        "Execute in parallel".to_string()
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(ParallelExecution {
            branches: Self::closures(args)?,
            state: ParallelState::default(),
        }))
    }

    fn resume(
        &self,
        args: &[Val],
        state: Option<serde_json::Value>,
    ) -> Result<Box<dyn StepExecution>, Failure> {
        let state = match state {
            Some(state) => serde_json::from_value(state)
                .map_err(|e| Failure::internal(format!("bad parallel state: {}", e)))?,
            None => ParallelState::default(),
        };
        Ok(Box::new(ParallelExecution {
            branches: Self::closures(args)?,
            state,
        }))
    }
}

impl ParallelExecution {
    fn finish_if_done(&mut self, ctx: &StepContext) {
        if self.state.results.len() < self.branches.len() {
            return;
        }
        let mut failure: Option<Failure> = None;
        let mut values = Vec::with_capacity(self.branches.len());
        for outcome in self.state.results.values() {
            match outcome {
                Ok(value) => values.push(value.clone()),
                Err(err) => match failure.as_mut() {
                    Some(first) => first.add_suppressed(err.clone()),
                    None => failure = Some(err.clone()),
                },
            }
        }
        match failure {
            Some(failure) => ctx.on_failure(failure),
            None => ctx.on_success(Val::List(values)),
        }
    }
}

impl StepExecution for ParallelExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        if self.branches.is_empty() {
            ctx.on_success(Val::List(Vec::new()));
            return Ok(true);
        }
        for (i, closure) in self.branches.iter().enumerate() {
            ctx.body_invoker_for(closure.clone())
                .branch(format!("Branch: {}", i + 1))
                .start();
        }
        Ok(false)
    }

    fn on_body_complete(&mut self, ctx: &StepContext, index: usize, outcome: Outcome) {
        self.state.results.insert(index, outcome);
        self.finish_if_done(ctx);
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn status(&self) -> Option<String> {
        Some(format!(
            "{} of {} branches done",
            self.state.results.len(),
            self.branches.len()
        ))
    }
}

/* ===================== evaluate ===================== */

/// `evaluate(name, source)` - compile more script text and run it as a body
pub struct Evaluate;

struct EvaluateExecution {
    name: String,
    source: String,
}

impl StepDescriptor for Evaluate {
    fn function_name(&self) -> &str {
        "evaluate"
    }

    fn is_block(&self) -> bool {
        true
    }

    fn display_name(&self, args: &[Val]) -> String {
        match args.first() {
            Some(name) => format!("Evaluate {}", name),
            None => "Evaluate".to_string(),
        }
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("evaluate", args, 2, 2)?;
        Ok(Box::new(EvaluateExecution {
            name: str_arg("evaluate", args, 0)?,
            source: str_arg("evaluate", args, 1)?,
        }))
    }
}

impl StepExecution for EvaluateExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        let body = ctx.load_script(&self.name, &self.source)?;
        ctx.body_invoker_for(body).start();
        Ok(false)
    }
}
