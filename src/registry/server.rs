//! Registry server - Unix socket endpoint for the control protocol
//!
//! Provides:
//! - Unix stream socket listener at `<registry_endpoint_dir>/<pid>.sock`
//! - Client connection handling with a client cap
//! - Request routing to the instance registry

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::{CommandOutcome, InstanceRegistry};
use crate::domain::InstanceFilter;
use crate::error::{Result, TaroError};
use crate::ipc::codec::DEFAULT_MAX_FRAME;
use crate::ipc::{
    CommandParams, ControlError, ControlRequest, ControlResponse, ListParams, Methods, PingResult,
    StatusParams,
};

/// How long a rejected client gets to send the request we answer UNAVAILABLE to
const REJECT_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Bytes of that request read to find its id
const REJECT_READ_LIMIT: u64 = 4096;

/// Configuration for the registry server
#[derive(Debug, Clone)]
pub struct RegistryServerConfig {
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Longest request line accepted; a longer one closes the connection
    pub max_request_bytes: usize,
}

impl RegistryServerConfig {
    /// Socket named after this process inside `dir`
    pub fn for_process(dir: impl AsRef<Path>) -> Self {
        Self {
            socket_path: dir.as_ref().join(format!("{}.sock", std::process::id())),
            max_clients: 16,
            max_request_bytes: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_socket_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max.max(1);
        self
    }
}

/// Serves `ping`, `instances.list`, `instance.status` and `instance.command`.
pub struct RegistryServer {
    config: RegistryServerConfig,
    registry: Arc<InstanceRegistry>,
    clients: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl RegistryServer {
    pub fn new(config: RegistryServerConfig, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            config,
            registry,
            clients: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Bind the socket, replacing a stale file
    pub fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        UnixListener::bind(path)
            .map_err(|e| TaroError::IpcUnavailable(format!("Failed to bind {}: {}", path.display(), e)))
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept clients until `shutdown`; the socket file is removed on exit
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        log::info!("Registry endpoint at {}", self.config.socket_path.display());
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.accept(stream),
                    Err(e) => log::warn!("Registry accept error: {}", e),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        log::info!("Registry endpoint {} closed", self.config.socket_path.display());
        Ok(())
    }

    fn accept(&self, stream: UnixStream) {
        let active = self.clients.fetch_add(1, Ordering::SeqCst);
        let clients = Arc::clone(&self.clients);

        if active >= self.config.max_clients {
            log::warn!("Registry at capacity ({} clients), rejecting", self.config.max_clients);
            tokio::spawn(async move {
                reject_client(stream).await;
                clients.fetch_sub(1, Ordering::SeqCst);
            });
            return;
        }

        let registry = Arc::clone(&self.registry);
        let cancel = self.shutdown.child_token();
        let max_request = self.config.max_request_bytes;
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, registry, max_request, cancel).await {
                log::debug!("Registry client error: {}", e);
            }
            clients.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn write_response(writer: &mut (impl AsyncWrite + Unpin), response: &ControlResponse) -> Result<()> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

async fn reject_client(stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(REJECT_READ_LIMIT);
    let mut line = String::new();
    let id = match tokio::time::timeout(REJECT_READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => request_id(&line),
        _ => 0,
    };
    let response = ControlResponse::error(id, ControlError::unavailable("registry at client capacity"));
    let _ = write_response(&mut writer, &response).await;
}

fn request_id(line: &str) -> u64 {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}

/// Handle a single client connection. A request line longer than
/// `max_request` bytes is answered with INVALID_REQUEST and the connection closed.
async fn handle_client(
    stream: UnixStream,
    registry: Arc<InstanceRegistry>,
    max_request: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    // room for the newline
    let limit = max_request as u64 + 1;

    loop {
        buf.clear();
        let mut request = (&mut reader).take(limit);
        let read = tokio::select! {
            read = request.read_until(b'\n', &mut buf) => read?,
            _ = cancel.cancelled() => break,
        };
        if read == 0 {
            break;
        }
        if buf.len() > max_request && buf.last() != Some(&b'\n') {
            log::warn!("Registry client sent a request over {} bytes, closing", max_request);
            let error = ControlError::invalid_request(format!("request exceeds {} bytes", max_request));
            write_response(&mut writer, &ControlResponse::error(0, error)).await?;
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&registry, line);
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

/// Parse one request line and route it
pub fn handle_line(registry: &InstanceRegistry, line: &str) -> ControlResponse {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return ControlResponse::error(0, ControlError::parse_error(e.to_string())),
    };
    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
    match serde_json::from_value::<ControlRequest>(value) {
        Ok(request) => handle_request(registry, request),
        Err(e) => ControlResponse::error(id, ControlError::invalid_request(e.to_string())),
    }
}

fn params<T: DeserializeOwned + Default>(value: Value) -> std::result::Result<T, ControlError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| ControlError::invalid_params(e.to_string()))
}

fn required_params<T: DeserializeOwned>(value: Value) -> std::result::Result<T, ControlError> {
    serde_json::from_value(value).map_err(|e| ControlError::invalid_params(e.to_string()))
}

fn to_result(value: impl serde::Serialize) -> std::result::Result<Value, ControlError> {
    serde_json::to_value(value).map_err(|e| ControlError::internal_error(e.to_string()))
}

pub fn handle_request(registry: &InstanceRegistry, request: ControlRequest) -> ControlResponse {
    let id = request.id;
    let result = match request.method.as_str() {
        Methods::PING => to_result(PingResult {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instances: registry.len(),
        }),
        Methods::INSTANCES_LIST => params::<ListParams>(request.params).and_then(|p| {
            let filter = InstanceFilter {
                pattern: p.pattern,
                state: p.state,
            };
            to_result(registry.list(&filter))
        }),
        Methods::INSTANCE_STATUS => required_params::<StatusParams>(request.params).and_then(|p| {
            match registry.get(&p.instance_id) {
                Some(summary) => to_result(summary),
                None => Err(ControlError::not_found(&p.instance_id)),
            }
        }),
        Methods::INSTANCE_COMMAND => required_params::<CommandParams>(request.params).and_then(|p| {
            match registry.dispatch_command(&p.instance_id, &p.command) {
                CommandOutcome::Ok(summary) => to_result(summary),
                CommandOutcome::NotFound => Err(ControlError::not_found(&p.instance_id)),
                CommandOutcome::Rejected(reason) => Err(ControlError::rejected(reason)),
            }
        }),
        other => Err(ControlError::method_not_found(other)),
    };

    match result {
        Ok(value) => ControlResponse::success(id, value),
        Err(error) => ControlResponse::error(id, error),
    }
}
