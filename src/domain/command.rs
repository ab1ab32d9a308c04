//! Commands accepted by a managed instance.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Control command sent through the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Stop the instance; idempotent
    Stop,
    /// Deliver a POSIX signal to a running instance
    Signal { name: String },
    /// Open the pending latch of a held instance
    Release,
}

impl Command {
    pub fn signal(name: impl Into<String>) -> Self {
        Command::Signal { name: name.into() }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Stop => write!(f, "STOP"),
            Command::Signal { name } => write!(f, "SIGNAL({})", name),
            Command::Release => write!(f, "RELEASE"),
        }
    }
}
