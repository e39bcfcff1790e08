//! Core domain types: identifiers, schedules, retry policies and jobs.

pub mod clock;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod types;
