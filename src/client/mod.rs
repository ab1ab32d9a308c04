//! Client side of the control protocol
//!
//! Discovers registry endpoints of job-hosting processes and talks to them with
//! one request/response exchange per call. Calls never retry; a `NotFound` reply
//! only means the instance finished or was never there.

mod connection;
pub mod discovery;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use connection::exchange;
pub use discovery::{EndpointDiscovery, SocketDirDiscovery, StaticEndpoints};

use crate::config::Config;
use crate::domain::{Command, ExecutionState, InstanceFilter, InstanceId, InstanceSummary};
use crate::error::{Result, TaroError};
use crate::ipc::{
    CommandParams, ControlRequest, ControlResponse, ErrorCode, ListParams, Methods, PingResult,
    StatusParams,
};

/// Outcome of a client call
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Ok(T),
    /// The instance is unknown to the endpoint or already terminal
    NotFound,
    Rejected(String),
    Unavailable(String),
    Timeout,
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Reply::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Ok(value) => Reply::Ok(f(value)),
            Reply::NotFound => Reply::NotFound,
            Reply::Rejected(reason) => Reply::Rejected(reason),
            Reply::Unavailable(reason) => Reply::Unavailable(reason),
            Reply::Timeout => Reply::Timeout,
        }
    }
}

/// A discovered instance: where it lives and what state it was in when listed
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub endpoint: PathBuf,
    pub state: ExecutionState,
    pub summary: InstanceSummary,
}

pub struct Client {
    discovery: Arc<dyn EndpointDiscovery>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(discovery: Arc<dyn EndpointDiscovery>, timeout: Duration) -> Self {
        Self {
            discovery,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Client scanning the configured endpoint directory
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(SocketDirDiscovery::new(&config.registry_endpoint_dir)),
            Duration::from_millis(config.command_timeout_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Non-terminal instances across all reachable endpoints
    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceHandle>> {
        let params = ListParams {
            pattern: filter.pattern.clone(),
            state: filter.state,
        };
        let mut handles = Vec::new();
        for endpoint in self.discovery.endpoints().await? {
            let reply: Reply<Vec<InstanceSummary>> = self.call(&endpoint, Methods::INSTANCES_LIST, &params).await;
            match reply {
                Reply::Ok(summaries) => {
                    handles.extend(summaries.into_iter().map(|summary| InstanceHandle {
                        id: summary.id.clone(),
                        endpoint: endpoint.clone(),
                        state: summary.state,
                        summary,
                    }));
                }
                Reply::Timeout => log::warn!("Endpoint {} timed out, skipping", endpoint.display()),
                other => log::info!("Skipping endpoint {}: {:?}", endpoint.display(), other),
            }
        }
        Ok(handles)
    }

    pub async fn read_status(&self, handle: &InstanceHandle) -> Reply<InstanceSummary> {
        let params = StatusParams {
            instance_id: handle.id.clone(),
        };
        self.call(&handle.endpoint, Methods::INSTANCE_STATUS, &params).await
    }

    pub async fn send_command(&self, handle: &InstanceHandle, command: Command) -> Reply<InstanceSummary> {
        let params = CommandParams {
            instance_id: handle.id.clone(),
            command,
        };
        self.call(&handle.endpoint, Methods::INSTANCE_COMMAND, &params).await
    }

    pub async fn ping(&self, endpoint: &Path) -> Reply<PingResult> {
        self.call(endpoint, Methods::PING, &serde_json::json!({})).await
    }

    async fn call<P: Serialize, T: DeserializeOwned>(&self, endpoint: &Path, method: &str, params: &P) -> Reply<T> {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => return Reply::Rejected(format!("Failed to encode params: {}", e)),
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = ControlRequest::new(id, method, params);

        match exchange(endpoint, request, self.timeout).await {
            Ok(response) => interpret(response),
            Err(TaroError::IpcTimeout(_)) => Reply::Timeout,
            Err(e) => Reply::Unavailable(e.to_string()),
        }
    }
}

/// Map a control response onto a typed reply
fn interpret<T: DeserializeOwned>(response: ControlResponse) -> Reply<T> {
    if let Some(error) = response.error {
        return match error.code {
            ErrorCode::NOT_FOUND => Reply::NotFound,
            ErrorCode::REJECTED => Reply::Rejected(error.message),
            ErrorCode::UNAVAILABLE => Reply::Unavailable(error.message),
            code => Reply::Rejected(format!("{} ({})", error.message, code)),
        };
    }
    let value = response.result.unwrap_or(serde_json::Value::Null);
    match serde_json::from_value(value) {
        Ok(result) => Reply::Ok(result),
        Err(e) => Reply::Unavailable(format!("Malformed result: {}", e)),
    }
}
