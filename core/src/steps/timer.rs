//! `sleep(ms)`

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{check_arg_count, num_arg};
use crate::engine::{StepContext, StepDescriptor, StepExecution};
use crate::error::{codes, Failure};
use crate::script::Val;

pub struct Sleep;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SleepState {
    deadline: DateTime<Utc>,
}

struct SleepExecution {
    millis: i64,
    deadline: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
}

impl StepDescriptor for Sleep {
    fn function_name(&self) -> &str {
        "sleep"
    }

    fn display_name(&self, args: &[Val]) -> String {
        match args.first() {
            Some(ms) => format!("Sleep {} ms", ms),
            None => "Sleep".to_string(),
        }
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        check_arg_count("sleep", args, 1, 1)?;
        let millis = sleep_millis(args)?;
        Ok(Box::new(SleepExecution {
            millis,
            deadline: None,
            timer: None,
        }))
    }

    fn resume(
        &self,
        args: &[Val],
        state: Option<serde_json::Value>,
    ) -> Result<Box<dyn StepExecution>, Failure> {
        let mut execution = SleepExecution {
            millis: sleep_millis(args)?,
            deadline: None,
            timer: None,
        };
        if let Some(state) = state {
            let state: SleepState = serde_json::from_value(state)
                .map_err(|e| Failure::internal(format!("bad sleep state: {}", e)))?;
            execution.deadline = Some(state.deadline);
        }
        Ok(Box::new(execution))
    }
}

/// Requested duration; rejects values no deadline can be computed for
fn sleep_millis(args: &[Val]) -> Result<i64, Failure> {
    let ms = num_arg("sleep", args, 0)?;
    if !ms.is_finite() || ms >= i64::MAX as f64 {
        return Err(out_of_range(ms));
    }
    let millis = ms.max(0.0) as i64;
    deadline_after(Utc::now(), millis)?;
    Ok(millis)
}

fn deadline_after(now: DateTime<Utc>, millis: i64) -> Result<DateTime<Utc>, Failure> {
    ChronoDuration::try_milliseconds(millis)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| out_of_range(millis as f64))
}

fn out_of_range(ms: f64) -> Failure {
    Failure::new(
        codes::WRONG_ARG_TYPE,
        format!("sleep: duration {} ms is out of range", ms),
    )
}

impl SleepExecution {
    fn arm(&mut self, ctx: &StepContext, deadline: DateTime<Utc>) -> Result<(), Failure> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Failure::internal(format!("sleep needs a runtime: {}", e)))?;
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        let ctx = ctx.clone();
        self.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(remaining).await;
            ctx.on_success(Val::Null);
        }));
        Ok(())
    }
}

impl StepExecution for SleepExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        let deadline = deadline_after(Utc::now(), self.millis)?;
        self.deadline = Some(deadline);
        self.arm(ctx, deadline)?;
        Ok(false)
    }

    fn stop(&mut self, ctx: &StepContext, cause: &Failure) -> Result<(), Failure> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        ctx.on_failure(cause.clone());
        Ok(())
    }

    fn on_resume(&mut self, ctx: &StepContext) {
        let deadline = self.deadline.unwrap_or_else(Utc::now);
        if let Err(failure) = self.arm(ctx, deadline) {
            ctx.on_failure(failure);
        }
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        let deadline = self.deadline?;
        serde_json::to_value(SleepState { deadline }).ok()
    }

    fn status(&self) -> Option<String> {
        self.deadline
            .map(|deadline| format!("sleeping until {}", deadline.to_rfc3339()))
    }
}
