//! Standard steps
//!
//! The steps every script can call. Hosts add their own through the
//! `StepRegistry` and may start from `standard_registry`.

pub mod basic;
pub mod blocks;
pub mod signal;
pub mod timer;

#[cfg(test)]
mod tests;

use crate::engine::StepRegistry;
use crate::error::{codes, Failure};
use crate::script::Val;

pub use basic::{Echo, Env, ErrorStep, Instant};
pub use blocks::{Evaluate, Parallel, Stage, WithContext};
pub use signal::{SignalBoard, WaitForSignal};
pub use timer::Sleep;

/// Registry with every standard step
pub fn standard_registry(signals: &SignalBoard) -> StepRegistry {
    StepRegistry::new()
        .register(Echo)
        .register(ErrorStep)
        .register(Instant)
        .register(Env)
        .register(Sleep)
        .register(WaitForSignal::new(signals.clone()))
        .register(Stage)
        .register(WithContext)
        .register(Parallel)
        .register(Evaluate)
}

/* ===================== Argument Helpers ===================== */

pub(crate) fn check_arg_count(function: &str, args: &[Val], min: usize, max: usize) -> Result<(), Failure> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(Failure::new(
            codes::WRONG_ARG_COUNT,
            format!("{}: expected {} arguments, got {}", function, expected, args.len()),
        ));
    }
    Ok(())
}

pub(crate) fn str_arg(function: &str, args: &[Val], index: usize) -> Result<String, Failure> {
    match args.get(index) {
        Some(Val::Str(s)) => Ok(s.clone()),
        Some(other) => Err(Failure::new(
            codes::WRONG_ARG_TYPE,
            format!(
                "{}: argument {} must be a string, got {}",
                function,
                index + 1,
                other.type_name()
            ),
        )),
        None => Err(Failure::new(
            codes::WRONG_ARG_COUNT,
            format!("{}: missing argument {}", function, index + 1),
        )),
    }
}

pub(crate) fn num_arg(function: &str, args: &[Val], index: usize) -> Result<f64, Failure> {
    match args.get(index) {
        Some(Val::Num(n)) => Ok(*n),
        Some(other) => Err(Failure::new(
            codes::WRONG_ARG_TYPE,
            format!(
                "{}: argument {} must be a number, got {}",
                function,
                index + 1,
                other.type_name()
            ),
        )),
        None => Err(Failure::new(
            codes::WRONG_ARG_COUNT,
            format!("{}: missing argument {}", function, index + 1),
        )),
    }
}
