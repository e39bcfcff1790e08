//! Command execution.
//!
//! This module provides the process runner seam and the retrying job
//! executor that sits on top of it.

mod command;
mod executor;

pub use command::{
    CommandOutput, CommandRunner, ExecutionError, MAX_CAPTURED_OUTPUT, ShellRunner,
    truncate_output,
};
pub use executor::{
    AttemptOutcome, ExecutionRecord, ExecutionRequest, JobExecutor, JobResult, RunOutcome,
};
