//! Per-listener forwarding task with a bounded redelivery buffer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::domain::Event;
use crate::ipc::{JsonCodec, PushMessage};

/// A listening server this bus pushes events to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRegistration {
    pub endpoint: PathBuf,
    /// Glob over job ids; `None` forwards every job
    #[serde(default)]
    pub job_filter: Option<String>,
}

impl ListenerRegistration {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            job_filter: None,
        }
    }

    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.job_filter = Some(pattern.into());
        self
    }

    pub fn matches(&self, job_id: &str) -> bool {
        match &self.job_filter {
            None => true,
            Some(pattern) => match glob::Pattern::new(pattern) {
                Ok(p) => p.matches(job_id),
                Err(_) => pattern == job_id,
            },
        }
    }
}

impl From<&ListenerConfig> for ListenerRegistration {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            job_filter: config.job_filter.clone(),
        }
    }
}

/// Most recent undelivered events, oldest first.
#[derive(Debug)]
pub struct DeliveryBuffer {
    events: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl DeliveryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Queue an event. Returns true when the oldest event was dropped to make room.
    pub fn push(&mut self, event: Event) -> bool {
        let overflow = self.events.len() >= self.capacity;
        if overflow {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
        overflow
    }

    /// Put back an event whose delivery failed. It is dropped instead when
    /// newer events already fill the buffer.
    pub fn requeue(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            return true;
        }
        self.events.push_front(event);
        false
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Events dropped since the last reported gap
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Take the pending drop count, leaving zero behind
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Counters shared between a forwarder task and the bus.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub connected: AtomicBool,
}

impl ForwarderStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

type PushConnection = Framed<UnixStream, JsonCodec<PushMessage>>;

pub(crate) struct Forwarder {
    pub registration: ListenerRegistration,
    pub source: String,
    pub capacity: usize,
    pub retry: Duration,
    pub stats: Arc<ForwarderStats>,
    pub cancel: CancellationToken,
}

impl Forwarder {
    async fn connect(&self) -> std::io::Result<PushConnection> {
        let stream = UnixStream::connect(&self.registration.endpoint).await?;
        let mut conn = Framed::new(stream, JsonCodec::new());
        conn.send(PushMessage::Hello {
            source: self.source.clone(),
        })
        .await?;
        Ok(conn)
    }

    /// Write out the pending gap marker and every buffered event.
    ///
    /// `rx` keeps draining into `buffer` while a frame is being written, so a
    /// peer that stops reading costs at most `capacity` events of memory and
    /// the overflow is reported as a gap. Returns `Ok(false)` when cancelled.
    async fn flush(
        &self,
        conn: &mut PushConnection,
        buffer: &mut DeliveryBuffer,
        rx: &mut mpsc::UnboundedReceiver<Event>,
        open: &mut bool,
    ) -> std::io::Result<bool> {
        loop {
            let message = match buffer.take_dropped() {
                0 => match buffer.pop_front() {
                    Some(event) => PushMessage::Event(event),
                    None => return Ok(true),
                },
                missed => PushMessage::Gap { missed },
            };

            let result = {
                let send = conn.send(message.clone());
                tokio::pin!(send);
                loop {
                    tokio::select! {
                        result = &mut send => break result,
                        _ = self.cancel.cancelled() => return Ok(false),
                        received = rx.recv(), if *open => match received {
                            Some(event) => self.enqueue(buffer, event),
                            None => *open = false,
                        },
                    }
                }
            };

            match (result, message) {
                (Ok(()), PushMessage::Event(_)) => {
                    self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                }
                (Ok(()), _) => {}
                (Err(e), PushMessage::Event(event)) => {
                    if buffer.requeue(event) {
                        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                    }
                    return Err(e);
                }
                (Err(e), PushMessage::Gap { missed }) => {
                    buffer.dropped += missed;
                    return Err(e);
                }
                (Err(e), PushMessage::Hello { .. }) => return Err(e),
            }
        }
    }

    fn enqueue(&self, buffer: &mut DeliveryBuffer, event: Event) {
        if buffer.push(event) {
            self.stats.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Deliver events from `rx` until the channel closes or the task is cancelled.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let endpoint = self.registration.endpoint.display().to_string();
        let mut buffer = DeliveryBuffer::new(self.capacity);
        let mut conn: Option<PushConnection> = None;
        let mut next_attempt = Instant::now();
        let mut open = true;

        loop {
            if conn.is_none() && Instant::now() >= next_attempt {
                match self.connect().await {
                    Ok(c) => {
                        log::info!("Connected to listener {}", endpoint);
                        self.stats.connected.store(true, Ordering::SeqCst);
                        conn = Some(c);
                    }
                    Err(e) => {
                        log::debug!("Listener {} unreachable: {}", endpoint, e);
                        next_attempt = Instant::now() + self.retry;
                    }
                }
            }

            if let Some(c) = conn.as_mut() {
                match self.flush(c, &mut buffer, &mut rx, &mut open).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::warn!(
                            "Delivery to listener {} failed, buffering {} events: {}",
                            endpoint,
                            buffer.len(),
                            e
                        );
                        self.stats.connected.store(false, Ordering::SeqCst);
                        conn = None;
                        next_attempt = Instant::now() + self.retry;
                    }
                }
            }

            if !open {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event) => {
                        self.enqueue(&mut buffer, event);
                        while let Ok(event) = rx.try_recv() {
                            self.enqueue(&mut buffer, event);
                        }
                    }
                    None => open = false,
                },
                _ = tokio::time::sleep_until(next_attempt), if conn.is_none() => {}
            }
        }

        self.stats.connected.store(false, Ordering::SeqCst);
        if !buffer.is_empty() {
            log::debug!("Listener {} closed with {} undelivered events", endpoint, buffer.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionState, InstanceId};
    use chrono::Utc;

    fn event(sequence: u64) -> Event {
        Event::new(
            InstanceId::new("job", "1-a"),
            sequence,
            None,
            ExecutionState::Created,
            Utc::now(),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_buffer_keeps_most_recent() {
        let mut buffer = DeliveryBuffer::new(2);
        assert!(!buffer.push(event(0)));
        assert!(!buffer.push(event(1)));
        assert!(buffer.push(event(2)));

        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop_front().unwrap().sequence, 1);
        assert_eq!(buffer.pop_front().unwrap().sequence, 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_take_dropped() {
        let mut buffer = DeliveryBuffer::new(1);
        buffer.push(event(0));
        buffer.push(event(1));
        assert_eq!(buffer.take_dropped(), 1);
        assert_eq!(buffer.dropped(), 0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let mut buffer = DeliveryBuffer::new(2);
        buffer.push(event(1));
        assert!(!buffer.requeue(event(0)));
        assert_eq!(buffer.pop_front().unwrap().sequence, 0);

        // newer events filled the buffer while the failed one was in flight
        let mut full = DeliveryBuffer::new(1);
        full.push(event(2));
        assert!(full.requeue(event(1)));
        assert_eq!(full.dropped(), 1);
        assert_eq!(full.pop_front().unwrap().sequence, 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut buffer = DeliveryBuffer::new(0);
        buffer.push(event(0));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_registration_filter() {
        let all = ListenerRegistration::new("/tmp/l.sock");
        assert!(all.matches("anything"));

        let filtered = ListenerRegistration::new("/tmp/l.sock").with_filter("backup*");
        assert!(filtered.matches("backup-db"));
        assert!(!filtered.matches("report"));
    }
}
