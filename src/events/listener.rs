//! Listening server: accepts event push streams from any number of job-hosting
//! processes and re-exposes them as one merged broadcast.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::domain::{Event, InstanceId};
use crate::error::{Result, TaroError};
use crate::ipc::{JsonCodec, PushMessage};

/// Configuration for the listening server
#[derive(Debug, Clone)]
pub struct ListeningServerConfig {
    pub bind_address: PathBuf,
    /// Capacity of the update broadcast channel
    pub channel_capacity: usize,
}

impl ListeningServerConfig {
    pub fn new(bind_address: impl Into<PathBuf>) -> Self {
        Self {
            bind_address: bind_address.into(),
            channel_capacity: 1024,
        }
    }
}

/// What the merged stream reports
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerUpdate {
    Connected {
        connection: u64,
        source: String,
    },
    Event {
        source: String,
        event: Event,
    },
    /// The sender dropped `missed` events from its buffer
    Gap {
        source: String,
        missed: u64,
    },
    /// Sequence numbers between `expected` and `received` never arrived
    SequenceGap {
        source: String,
        instance_id: InstanceId,
        expected: u64,
        received: u64,
    },
    Disconnected {
        connection: u64,
        source: Option<String>,
    },
}

type SequenceTable = Arc<Mutex<HashMap<(String, InstanceId), u64>>>;

/// Unix-socket server receiving `PushMessage` frames
pub struct ListeningServer {
    config: ListeningServerConfig,
    updates: broadcast::Sender<ListenerUpdate>,
    last_sequence: SequenceTable,
    next_connection: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl ListeningServer {
    pub fn new(config: ListeningServerConfig) -> Self {
        let (updates, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            updates,
            last_sequence: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.bind_address
    }

    /// Receive the merged update stream
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerUpdate> {
        self.updates.subscribe()
    }

    /// Bind the socket, replacing a stale one
    pub fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.bind_address;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        UnixListener::bind(path)
            .map_err(|e| TaroError::ListenerDelivery(format!("Failed to bind {}: {}", path.display(), e)))
    }

    /// Bind and serve until `shutdown` is called
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound socket until `shutdown` is called
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        log::info!("Listening for events on {}", self.config.bind_address.display());
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
                        let updates = self.updates.clone();
                        let last_sequence = Arc::clone(&self.last_sequence);
                        let cancel = self.shutdown.child_token();
                        tokio::spawn(async move {
                            handle_connection(stream, connection, updates, last_sequence, cancel).await;
                        });
                    }
                    Err(e) => log::warn!("Listener accept error: {}", e),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        let _ = std::fs::remove_file(&self.config.bind_address);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Decide what an incoming event means for the (source, instance) sequence table.
/// A terminal event ends the instance, so its entry is removed once accepted.
fn classify(
    table: &SequenceTable,
    source: &str,
    event: &Event,
) -> SequenceCheck {
    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
    let key = (source.to_string(), event.instance_id.clone());
    let check = match table.get(&key) {
        Some(&last) if event.sequence <= last => return SequenceCheck::Duplicate,
        Some(&last) if event.sequence > last + 1 => SequenceCheck::Gap { expected: last + 1 },
        _ => SequenceCheck::InOrder,
    };
    if event.is_terminal() {
        table.remove(&key);
    } else {
        table.insert(key, event.sequence);
    }
    check
}

enum SequenceCheck {
    InOrder,
    Duplicate,
    Gap { expected: u64 },
}

async fn handle_connection(
    stream: UnixStream,
    connection: u64,
    updates: broadcast::Sender<ListenerUpdate>,
    last_sequence: SequenceTable,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, JsonCodec::<PushMessage>::new());
    let mut source: Option<String> = None;

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = cancel.cancelled() => break,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                log::warn!("Dropping listener connection {}: {}", connection, e);
                break;
            }
            None => break,
        };

        match message {
            PushMessage::Hello { source: name } => {
                log::info!("Event source '{}' connected ({})", name, connection);
                source = Some(name.clone());
                let _ = updates.send(ListenerUpdate::Connected {
                    connection,
                    source: name,
                });
            }
            PushMessage::Gap { missed } => {
                let name = source.clone().unwrap_or_else(|| format!("connection-{}", connection));
                log::warn!("Event source '{}' dropped {} events", name, missed);
                let _ = updates.send(ListenerUpdate::Gap { source: name, missed });
            }
            PushMessage::Event(event) => {
                let name = source.clone().unwrap_or_else(|| format!("connection-{}", connection));
                match classify(&last_sequence, &name, &event) {
                    SequenceCheck::Duplicate => {
                        log::debug!("Duplicate event {}#{} from '{}'", event.instance_id, event.sequence, name);
                        continue;
                    }
                    SequenceCheck::Gap { expected } => {
                        let _ = updates.send(ListenerUpdate::SequenceGap {
                            source: name.clone(),
                            instance_id: event.instance_id.clone(),
                            expected,
                            received: event.sequence,
                        });
                    }
                    SequenceCheck::InOrder => {}
                }
                let _ = updates.send(ListenerUpdate::Event { source: name, event });
            }
        }
    }

    log::debug!("Listener connection {} closed", connection);
    let _ = updates.send(ListenerUpdate::Disconnected { connection, source });
}
