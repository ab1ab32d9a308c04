//! Job definitions, instance identity and instance snapshots

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::state::{ExecutionState, Lifecycle};
use crate::error::{Result, TaroError};

/// Per-definition execution constraints. `None` falls back to the runner defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,

    /// Stay in PENDING until a RELEASE command arrives
    #[serde(default)]
    pub hold_pending: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_output: Option<bool>,
}

/// Rule that adds a named warning to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarningRule {
    /// Instance still running `after_ms` after it entered RUNNING
    ExecTime { name: String, after_ms: u64 },
    /// A regex matches anywhere in an output line
    OutputMatches { name: String, pattern: String },
}

impl WarningRule {
    pub fn name(&self) -> &str {
        match self {
            WarningRule::ExecTime { name, .. } => name,
            WarningRule::OutputMatches { name, .. } => name,
        }
    }
}

/// What to run. Immutable once handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
    #[serde(default)]
    pub warnings: Vec<WarningRule>,
}

impl JobDefinition {
    pub fn new(job_id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            constraints: ExecutionConstraints::default(),
            warnings: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.constraints.grace_period_ms = Some(ms);
        self
    }

    pub fn hold_pending(mut self, hold: bool) -> Self {
        self.constraints.hold_pending = hold;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.constraints.capture_output = Some(capture);
        self
    }

    pub fn warning(mut self, rule: WarningRule) -> Self {
        self.warnings.push(rule);
        self
    }

    /// Compile the `OutputMatches` rules as (warning name, regex) pairs.
    pub fn output_rules(&self) -> Result<Vec<(String, Regex)>> {
        self.warnings
            .iter()
            .filter_map(|rule| match rule {
                WarningRule::OutputMatches { name, pattern } => Some(
                    Regex::new(pattern)
                        .map(|re| (name.clone(), re))
                        .map_err(|e| {
                            TaroError::Config(format!("warning rule '{}' has a bad pattern '{}': {}", name, pattern, e))
                        }),
                ),
                WarningRule::ExecTime { .. } => None,
            })
            .collect()
    }

    /// Printable command line
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{}'", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Identity of one job instance, displayed as `job_id@instance_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub job_id: String,
    pub instance_id: String,
}

impl InstanceId {
    pub fn new(job_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Glob match against the job id, the instance id or the full `job@instance` form
    pub fn matches(&self, pattern: &str) -> bool {
        match glob::Pattern::new(pattern) {
            Ok(p) => {
                p.matches(&self.job_id)
                    || p.matches(&self.instance_id)
                    || p.matches(&self.to_string())
            }
            Err(_) => pattern == self.job_id || pattern == self.to_string(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.job_id, self.instance_id)
    }
}

impl FromStr for InstanceId {
    type Err = TaroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('@') {
            Some((job, inst)) if !job.is_empty() && !inst.is_empty() => Ok(Self::new(job, inst)),
            _ => Err(TaroError::InvalidState(format!(
                "invalid instance id '{}', expected job@instance",
                s
            ))),
        }
    }
}

/// Point-in-time view of an instance. Also the persisted terminal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub state: ExecutionState,
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Last captured output line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub warnings: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub command: String,
}

impl InstanceSummary {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings.values().sum()
    }
}

/// Selection criteria for instance listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExecutionState>,
}

impl InstanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            state: None,
        }
    }

    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, summary: &InstanceSummary) -> bool {
        let pattern_ok = self
            .pattern
            .as_deref()
            .is_none_or(|p| summary.id.matches(p));
        let state_ok = self.state.is_none_or(|s| s == summary.state);
        pattern_ok && state_ok
    }
}
