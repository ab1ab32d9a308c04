//! Synchronous fan-out of transitions to every observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::forwarder::{Forwarder, ForwarderStats, ListenerRegistration};
use super::plugin::{PluginRegistry, Transition};
use crate::config::Config;
use crate::domain::{Event, InstanceId, InstanceSummary};
use crate::storage::{NoPersistence, Persistence};

/// Notified when an instance reaches a terminal state, before persistence.
pub trait TerminalObserver: Send + Sync {
    fn instance_terminated(&self, id: &InstanceId);
}

pub type ListenerId = u64;

struct ListenerHandle {
    id: ListenerId,
    registration: ListenerRegistration,
    tx: mpsc::UnboundedSender<Event>,
    stats: Arc<ForwarderStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Fan-out point for every transition of every instance in this process.
///
/// Publish order: plugins, terminal observers, persistence, in-process
/// subscribers, listener forwarders.
pub struct EventBus {
    plugins: PluginRegistry,
    terminal_observers: Vec<Arc<dyn TerminalObserver>>,
    persistence: Arc<dyn Persistence>,
    local: broadcast::Sender<Event>,
    listeners: Mutex<Vec<ListenerHandle>>,
    next_listener: AtomicU64,
    source: String,
    buffer_capacity: usize,
    retry: Duration,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("plugins", &self.plugins)
            .field("persistence", &self.persistence.name())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub struct EventBusBuilder {
    plugins: PluginRegistry,
    terminal_observers: Vec<Arc<dyn TerminalObserver>>,
    persistence: Option<Arc<dyn Persistence>>,
    source: Option<String>,
    buffer_capacity: usize,
    retry: Duration,
    subscriber_capacity: usize,
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self {
            plugins: PluginRegistry::new(),
            terminal_observers: Vec::new(),
            persistence: None,
            source: None,
            buffer_capacity: 256,
            retry: Duration::from_millis(1000),
            subscriber_capacity: 1024,
        }
    }
}

impl EventBusBuilder {
    /// Take listener buffer and retry settings from the configuration
    pub fn config(mut self, config: &Config) -> Self {
        self.buffer_capacity = config.listener_buffer_capacity;
        self.retry = Duration::from_millis(config.listener_retry_ms);
        self
    }

    pub fn plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn terminal_observer(mut self, observer: Arc<dyn TerminalObserver>) -> Self {
        self.terminal_observers.push(observer);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Name announced in the `Hello` frame to listeners
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn listener_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> EventBus {
        let (local, _) = broadcast::channel(self.subscriber_capacity);
        EventBus {
            plugins: self.plugins,
            terminal_observers: self.terminal_observers,
            persistence: self.persistence.unwrap_or_else(|| Arc::new(NoPersistence)),
            local,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            source: self
                .source
                .unwrap_or_else(|| format!("taro-{}", std::process::id())),
            buffer_capacity: self.buffer_capacity,
            retry: self.retry,
        }
    }
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Deliver one transition. Called by the instance owner with its transition
    /// lock held, so per-instance order is the lifecycle order.
    pub fn publish(&self, event: &Event, snapshot: &InstanceSummary) {
        self.plugins.notify(&Transition {
            instance: snapshot,
            previous: event.previous_state,
            new_state: event.new_state,
        });

        if event.is_terminal() {
            for observer in &self.terminal_observers {
                observer.instance_terminated(&event.instance_id);
            }
            if let Err(e) = self.persistence.append(snapshot) {
                log::warn!(
                    "Failed to persist {} to {}: {}",
                    snapshot.id,
                    self.persistence.name(),
                    e
                );
            }
        }

        let _ = self.local.send(event.clone());

        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for handle in listeners.iter() {
            if handle.registration.matches(event.job_id()) && handle.tx.send(event.clone()).is_err() {
                log::debug!("Forwarder {} gone, event {} not queued", handle.id, event.sequence);
            }
        }
    }

    /// Tell plugins about a warning just counted on an instance
    pub fn warning(&self, snapshot: &InstanceSummary, name: &str) {
        self.plugins.notify_warning(snapshot, name);
    }

    /// Hand a captured output line to plugins
    pub fn output(&self, id: &InstanceId, line: &str) {
        self.plugins.notify_output(id, line);
    }

    /// In-process subscription to every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.local.subscribe()
    }

    /// Start forwarding to a listening server. Must be called inside a tokio runtime.
    pub fn connect_listener(&self, registration: ListenerRegistration) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ForwarderStats::default());
        let cancel = CancellationToken::new();

        let forwarder = Forwarder {
            registration: registration.clone(),
            source: self.source.clone(),
            capacity: self.buffer_capacity,
            retry: self.retry,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(forwarder.run(rx));

        log::info!("Forwarding events to {} (listener {})", registration.endpoint.display(), id);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(ListenerHandle {
            id,
            registration,
            tx,
            stats,
            cancel,
            task,
        });
        id
    }

    /// Stop forwarding. The forwarder makes a last delivery attempt and exits.
    pub fn disconnect_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        match listeners.iter().position(|h| h.id == id) {
            Some(pos) => {
                let handle = listeners.remove(pos);
                log::info!("Stopped forwarding to {}", handle.registration.endpoint.display());
                true
            }
            None => false,
        }
    }

    pub fn listener_stats(&self, id: ListenerId) -> Option<Arc<ForwarderStats>> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners
            .iter()
            .find(|h| h.id == id)
            .map(|h| Arc::clone(&h.stats))
    }

    pub fn listener_ids(&self) -> Vec<ListenerId> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.iter().map(|h| h.id).collect()
    }

    /// Let every forwarder make a final delivery attempt, waiting at most
    /// `timeout` for each, then cancel what is left.
    pub async fn close(&self, timeout: Duration) {
        let handles: Vec<ListenerHandle> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.drain(..).collect()
        };
        for handle in handles {
            let ListenerHandle {
                id,
                tx,
                cancel,
                mut task,
                ..
            } = handle;
            drop(tx);
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                log::warn!("Listener {} did not drain in {}ms", id, timeout.as_millis());
                cancel.cancel();
                task.abort();
            }
        }
    }

    /// Cancel every forwarder immediately, discarding undelivered events
    pub fn shutdown(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for handle in listeners.drain(..) {
            handle.cancel.cancel();
        }
    }
}
