//! Runner module - job instance execution and lifecycle.
//!
//! This module provides:
//! - Runner: starts instances and supervises each on its own task
//! - JobInstance: the live, lock-protected state of one instance
//! - process helpers for program lookup, spawning and signals

mod instance;
mod job_runner;
pub mod process;

pub use instance::JobInstance;
pub use job_runner::Runner;
