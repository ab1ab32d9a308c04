//! Event distribution
//!
//! - EventBus: in-process fan-out of transitions
//! - JobPlugin / PluginRegistry: statically registered lifecycle, warning and output hooks
//! - Forwarder: buffered push of events to listening servers
//! - ListeningServer: receiving end of the push protocol

pub mod bus;
pub mod forwarder;
pub mod listener;
pub mod plugin;

pub use bus::{EventBus, EventBusBuilder, ListenerId, TerminalObserver};
pub use forwarder::{DeliveryBuffer, ForwarderStats, ListenerRegistration};
pub use listener::{ListenerUpdate, ListeningServer, ListeningServerConfig};
pub use plugin::{EchoPlugin, JobPlugin, LogPlugin, PluginRegistry, Transition};
