//! CLI module for taro - command-line interface and subcommands.
//!
//! Provides the entry point for running jobs, inspecting and commanding live
//! instances, listening for events and reading history.

pub mod commands;

pub use commands::Cli;
