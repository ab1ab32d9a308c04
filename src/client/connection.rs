//! One request/response exchange with a registry endpoint

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{Result, TaroError};
use crate::ipc::{ControlRequest, ControlResponse, NdJsonCodec};

/// Connect, send `request`, read one response, close. The whole exchange is
/// bounded by `timeout`.
pub async fn exchange(endpoint: &Path, request: ControlRequest, timeout: Duration) -> Result<ControlResponse> {
    let timeout_ms = timeout.as_millis() as u64;
    tokio::time::timeout(timeout, exchange_inner(endpoint, request))
        .await
        .map_err(|_| TaroError::IpcTimeout(timeout_ms))?
}

async fn exchange_inner(endpoint: &Path, request: ControlRequest) -> Result<ControlResponse> {
    let stream = UnixStream::connect(endpoint)
        .await
        .map_err(|e| TaroError::IpcUnavailable(format!("{}: {}", endpoint.display(), e)))?;
    let (reader, writer) = stream.into_split();
    let mut requests = FramedWrite::new(writer, NdJsonCodec::<ControlRequest>::new());
    let mut responses = FramedRead::new(reader, NdJsonCodec::<ControlResponse>::new());

    let request_id = request.id;
    requests
        .send(request)
        .await
        .map_err(|e| TaroError::IpcUnavailable(format!("Failed to send request: {}", e)))?;

    match responses.next().await {
        Some(Ok(response)) => {
            if response.id != request_id {
                log::debug!("Response id {} does not match request {}", response.id, request_id);
            }
            Ok(response)
        }
        Some(Err(e)) => Err(TaroError::IpcUnavailable(format!("Bad response: {}", e))),
        None => Err(TaroError::IpcUnavailable(format!(
            "{} closed the connection",
            endpoint.display()
        ))),
    }
}
