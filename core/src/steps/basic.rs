//! Steps that finish inside `start`

use serde_json::json;

use super::{check_arg_count, str_arg};
use crate::engine::{StepContext, StepDescriptor, StepExecution};
use crate::error::{codes, Failure};
use crate::flow::NodeAction;
use crate::script::Val;

/* ===================== echo ===================== */

/// `echo(message)` - write a line to the execution log
pub struct Echo;

struct EchoExecution {
    message: String,
}

impl StepDescriptor for Echo {
    fn function_name(&self) -> &str {
        "echo"
    }

    fn display_name(&self, _args: &[Val]) -> String {
        "Print Message".to_string()
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("echo", args, 0, 1)?;
        let message = args.first().map(|v| v.to_string()).unwrap_or_default();
        Ok(Box::new(EchoExecution { message }))
    }
}

impl StepExecution for EchoExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        ctx.listener().log(&self.message);
        ctx.add_action(NodeAction::new("log", json!({ "message": self.message })));
        ctx.on_success(Val::Null);
        Ok(true)
    }
}

/* ===================== error ===================== */

/// `error(message)` - fail with a step failure
pub struct ErrorStep;

struct ErrorExecution {
    message: String,
}

impl StepDescriptor for ErrorStep {
    fn function_name(&self) -> &str {
        "error"
    }

    fn display_name(&self, _args: &[Val]) -> String {
        "Error signal".to_string()
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("error", args, 1, 1)?;
        Ok(Box::new(ErrorExecution {
            message: args[0].to_string(),
        }))
    }
}

impl StepExecution for ErrorExecution {
    fn start(&mut self, _ctx: &StepContext) -> Result<bool, Failure> {
        Err(Failure::new(codes::STEP_FAILED, self.message.clone()))
    }
}

/* ===================== instant ===================== */

/// `instant(value?)` - return the value right away
pub struct Instant;

struct InstantExecution {
    value: Val,
}

impl StepDescriptor for Instant {
    fn function_name(&self) -> &str {
        "instant"
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("instant", args, 0, 1)?;
        Ok(Box::new(InstantExecution {
            value: args.first().cloned().unwrap_or(Val::Null),
        }))
    }
}

impl StepExecution for InstantExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        ctx.on_success(self.value.clone());
        Ok(true)
    }
}

/* ===================== env ===================== */

/// `env(key)` - contextual variable set by an enclosing `with_context`, or null
pub struct Env;

struct EnvExecution {
    key: String,
}

impl StepDescriptor for Env {
    fn function_name(&self) -> &str {
        "env"
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("env", args, 1, 1)?;
        Ok(Box::new(EnvExecution {
            key: str_arg("env", args, 0)?,
        }))
    }
}

impl StepExecution for EnvExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        ctx.on_success(ctx.get_context(&self.key).unwrap_or(Val::Null));
        Ok(true)
    }
}
