//! Wire layer shared by the registry server, the client and the event push path
//!
//! This module provides:
//! - Message types for the control and push protocols
//! - Length-prefixed and newline-delimited JSON codecs

pub mod codec;
pub mod messages;

pub use codec::{JsonCodec, NdJsonCodec};
pub use messages::{
    CommandParams, ControlError, ControlRequest, ControlResponse, ErrorCode, ListParams, Methods,
    PingResult, PushMessage, StatusParams,
};
