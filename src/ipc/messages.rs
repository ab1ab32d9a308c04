//! Wire message types.
//!
//! Control protocol: JSON Lines over a Unix stream socket, one request and one
//! response per exchange. Field names follow the familiar `id`/`method`/`params`/
//! `result`/`error` layout without implementing JSON-RPC 2.0.
//!
//! Push protocol: length-prefixed `PushMessage` frames from a job-hosting process
//! to a listening server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Command, Event, ExecutionState, InstanceId};

/// Request sent from a client to a registry endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    /// Method name (see `Methods`)
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ControlRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn no_params(id: u64, method: impl Into<String>) -> Self {
        Self::new(id, method, Value::Object(Default::default()))
    }
}

/// Response sent from a registry endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: ControlError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Error details in a control response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Unknown method: {}", method.into()),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }

    pub fn not_found(id: &InstanceId) -> Self {
        Self::with_data(
            ErrorCode::NOT_FOUND,
            format!("Instance not found: {}", id),
            serde_json::json!({ "instance_id": id.to_string() }),
        )
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::REJECTED, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::UNAVAILABLE, reason)
    }
}

/// Result codes.
pub struct ErrorCode;

impl ErrorCode {
    /// Invalid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal registry error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Instance id unknown or already terminal.
    pub const NOT_FOUND: i32 = 1001;
    /// Command not applicable in the instance's current state.
    pub const REJECTED: i32 = 1002;
    /// Endpoint cannot serve the request (e.g. at client capacity).
    pub const UNAVAILABLE: i32 = 1003;
}

/// Control method names.
pub struct Methods;

impl Methods {
    pub const PING: &'static str = "ping";
    pub const INSTANCES_LIST: &'static str = "instances.list";
    pub const INSTANCE_STATUS: &'static str = "instance.status";
    pub const INSTANCE_COMMAND: &'static str = "instance.command";
}

/// Params of `instances.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExecutionState>,
}

/// Params of `instance.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusParams {
    pub instance_id: InstanceId,
}

/// Params of `instance.command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    pub instance_id: InstanceId,
    pub command: Command,
}

/// Result of `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub pid: u32,
    pub version: String,
    pub instances: usize,
}

/// Frame on the event push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// First frame of every connection
    Hello { source: String },
    Event(Event),
    /// `missed` events were dropped from the sender's buffer
    Gap { missed: u64 },
}
