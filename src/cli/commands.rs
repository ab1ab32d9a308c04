//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - exec: run a command as a managed job instance
//! - ps: list live instances
//! - stop / signal / release: command live instances
//! - listen: receive pushed events
//! - history: read persisted records

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Taro - run, supervise and command local jobs
#[derive(Parser, Debug)]
#[command(name = "taro")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command as a managed job instance
    Exec {
        /// Job name (defaults to the program's file name)
        #[arg(short, long)]
        job: Option<String>,

        /// Hold the instance in PENDING until released
        #[arg(long)]
        hold: bool,

        /// Grace period between SIGTERM and SIGKILL on stop
        #[arg(long)]
        grace_ms: Option<u64>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List live instances
    Ps {
        /// Glob over job id, instance id or job@instance
        pattern: Option<String>,
    },

    /// Stop matching instances
    Stop {
        pattern: String,
    },

    /// Send a signal to matching running instances
    Signal {
        pattern: String,

        /// Signal name or number (TERM, SIGUSR1, 9, ...)
        signal: String,
    },

    /// Release matching held instances
    Release {
        pattern: String,
    },

    /// Receive events pushed by job-hosting processes
    Listen,

    /// Show persisted instance records
    History {
        /// Glob over job id
        #[arg(short, long)]
        job: Option<String>,

        /// Only records that ended in this state
        #[arg(short, long)]
        state: Option<String>,

        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only the latest record of each job
        #[arg(long)]
        last: bool,
    },
}
