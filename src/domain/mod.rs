//! Domain types for taro
//!
//! Pure data shared by every subsystem:
//! - JobDefinition: what to run, with constraints and warning rules
//! - InstanceId / InstanceSummary: identity and snapshot of a job instance
//! - ExecutionState / Lifecycle: the state machine and its history
//! - Event: one record per transition
//! - Command: control commands accepted by a managed instance

pub mod command;
pub mod event;
pub mod job;
pub mod state;

pub use command::Command;
pub use event::{Event, transition_payload};
pub use job::{
    ExecutionConstraints, InstanceFilter, InstanceId, InstanceSummary, JobDefinition, WarningRule,
};
pub use state::{ExecutionState, Lifecycle, StateChange};
