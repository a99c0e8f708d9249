//! Repeated-trial consistency harness for benchmark tasks.
//!
//! A task that previously passed evaluation is re-tested several times, with
//! its `src/` tree restored between trials, to catch flaky passes caused by
//! timing, randomness, or leftover state.
//!
//! - **[`task`]**: task selection and evaluation records.
//! - **[`snapshot`]**: backup, restore, and verification of a task's `src/`.
//! - **[`trial`]**: one test-command execution per attempt.
//! - **[`validator`]**: the per-task state machine.
//! - **[`report`]**: batch orchestration, summary, and the JSON report.

pub mod cli;
pub mod config;
pub mod exit_codes;
pub mod logging;
pub mod process;
pub mod report;
pub mod snapshot;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod trial;
pub mod validator;
