//! Execution state machine and lifecycle history

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaroError};

/// State of a job instance's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Instance exists, nothing acquired yet
    Created,
    /// Waiting for the release latch and a concurrency slot
    Pending,
    /// Process is executing
    Running,
    /// Process exited with code 0
    Completed,
    /// Process could not start, exited non-zero or died by signal
    Failed,
    /// Stopped on request (never ran, or exited within the grace period)
    Stopped,
    /// Killed after ignoring a stop request past the grace period
    Interrupted,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 7] = [
        ExecutionState::Created,
        ExecutionState::Pending,
        ExecutionState::Running,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Stopped,
        ExecutionState::Interrupted,
    ];

    /// Returns true if no further transition can leave this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Stopped
                | ExecutionState::Interrupted
        )
    }

    pub fn is_before_execution(&self) -> bool {
        matches!(self, ExecutionState::Created | ExecutionState::Pending)
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, ExecutionState::Running)
    }

    /// Ended without completing: stopped or interrupted
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ExecutionState::Stopped | ExecutionState::Interrupted)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match self {
            Created => matches!(next, Pending | Failed | Stopped),
            Pending => matches!(next, Running | Failed | Stopped),
            Running => matches!(next, Completed | Failed | Stopped | Interrupted),
            Completed | Failed | Stopped | Interrupted => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Pending => "PENDING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Stopped => "STOPPED",
            ExecutionState::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionState {
    type Err = TaroError;

    fn from_str(s: &str) -> Result<Self> {
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TaroError::InvalidState(format!("unknown execution state '{}'", s)))
    }
}

/// One entry of the lifecycle history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: ExecutionState,
    pub changed_at: DateTime<Utc>,
}

/// Ordered log of the states an instance passed through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lifecycle {
    changes: Vec<StateChange>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, `None` before the CREATED entry is recorded
    pub fn state(&self) -> Option<ExecutionState> {
        self.changes.last().map(|c| c.state)
    }

    pub fn states(&self) -> Vec<ExecutionState> {
        self.changes.iter().map(|c| c.state).collect()
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    /// When the instance entered `state`, if it did
    pub fn changed(&self, state: ExecutionState) -> Option<DateTime<Utc>> {
        self.changes
            .iter()
            .find(|c| c.state == state)
            .map(|c| c.changed_at)
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.changes.last().map(|c| c.changed_at)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.changed(ExecutionState::Created)
    }

    /// Whether the process ever ran
    pub fn executed(&self) -> bool {
        self.execution_started().is_some()
    }

    pub fn execution_started(&self) -> Option<DateTime<Utc>> {
        self.changes
            .iter()
            .find(|c| c.state.is_executing())
            .map(|c| c.changed_at)
    }

    pub fn execution_finished(&self) -> Option<DateTime<Utc>> {
        self.changes
            .last()
            .filter(|c| c.state.is_terminal())
            .map(|c| c.changed_at)
    }

    /// Time spent executing; measured up to now while still running
    pub fn execution_time(&self) -> Option<chrono::Duration> {
        let started = self.execution_started()?;
        let finished = self.execution_finished().unwrap_or_else(Utc::now);
        Some(finished - started)
    }

    /// Append a transition, enforcing the state graph
    pub fn record(&mut self, state: ExecutionState, at: DateTime<Utc>) -> Result<()> {
        match self.state() {
            None if state != ExecutionState::Created => Err(TaroError::InvalidState(format!(
                "lifecycle must start with CREATED, got {}",
                state
            ))),
            Some(current) if !current.can_transition_to(state) => Err(TaroError::InvalidState(
                format!("illegal transition {} -> {}", current, state),
            )),
            _ => {
                self.changes.push(StateChange {
                    state,
                    changed_at: at,
                });
                Ok(())
            }
        }
    }
}
