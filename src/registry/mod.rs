//! Managed instance registry
//!
//! Process-wide table of non-terminal instances. Lookups clone the instance
//! handle under the read lock and release it before snapshotting or running a
//! command, so a slow command on one instance never blocks reads of another.

pub mod server;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use server::{RegistryServer, RegistryServerConfig};

use crate::domain::{Command, InstanceFilter, InstanceId, InstanceSummary};
use crate::error::TaroError;
use crate::events::TerminalObserver;
use crate::runner::JobInstance;

/// Result of a command dispatched through the registry
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Ok(InstanceSummary),
    NotFound,
    Rejected(String),
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Arc<JobInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<InstanceId, Arc<JobInstance>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<InstanceId, Arc<JobInstance>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, instance: Arc<JobInstance>) {
        log::debug!("Registered {}", instance.id());
        self.write().insert(instance.id().clone(), instance);
    }

    pub fn unregister(&self, id: &InstanceId) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            log::debug!("Unregistered {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Live handle, if the instance is still managed
    pub fn get_instance(&self, id: &InstanceId) -> Option<Arc<JobInstance>> {
        self.read().get(id).cloned()
    }

    /// Snapshot of a managed instance; terminal instances count as gone
    pub fn get(&self, id: &InstanceId) -> Option<InstanceSummary> {
        let instance = self.get_instance(id)?;
        let summary = instance.summary();
        (!summary.is_terminal()).then_some(summary)
    }

    /// Snapshots of managed instances matching the filter, oldest first
    pub fn list(&self, filter: &InstanceFilter) -> Vec<InstanceSummary> {
        let instances: Vec<Arc<JobInstance>> = self.read().values().cloned().collect();
        let mut summaries: Vec<InstanceSummary> = instances
            .iter()
            .map(|instance| instance.summary())
            .filter(|summary| !summary.is_terminal() && filter.matches(summary))
            .collect();
        summaries.sort_by(|a, b| {
            a.lifecycle
                .created_at()
                .cmp(&b.lifecycle.created_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        summaries
    }

    pub fn dispatch_command(&self, id: &InstanceId, command: &Command) -> CommandOutcome {
        let Some(instance) = self.get_instance(id) else {
            return CommandOutcome::NotFound;
        };
        if instance.state().is_terminal() {
            return CommandOutcome::NotFound;
        }

        log::info!("Dispatching {} to {}", command, id);
        let result = match command {
            Command::Stop => {
                instance.stop();
                Ok(())
            }
            Command::Signal { name } => instance.signal(name),
            Command::Release => instance.release(),
        };

        match result {
            Ok(()) => CommandOutcome::Ok(instance.summary()),
            Err(TaroError::CommandRejected(reason)) => CommandOutcome::Rejected(reason),
            Err(TaroError::NotFound(_)) => CommandOutcome::NotFound,
            Err(e) => CommandOutcome::Rejected(e.to_string()),
        }
    }
}

impl TerminalObserver for InstanceRegistry {
    fn instance_terminated(&self, id: &InstanceId) {
        self.unregister(id);
    }
}
