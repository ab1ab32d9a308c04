//! Taro - local job execution and supervision
//!
//! Taro runs external programs as managed job instances, moves each through a
//! strict lifecycle state machine, lets other processes find and command live
//! instances over a Unix socket, and fans every state transition out to plugins,
//! persistence and remote listening servers.

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod id;
pub mod ipc;
pub mod registry;
pub mod runner;
pub mod storage;

pub use error::{Result, TaroError};
