//! End-to-end tests for flow executions

mod helpers;
mod interrupt_tests;
mod run_tests;
