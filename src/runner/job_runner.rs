//! Runner: starts job instances and supervises them to a terminal state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::instance::JobInstance;
use super::process;
use crate::config::JobDefaults;
use crate::domain::{ExecutionState, InstanceId, InstanceSummary, JobDefinition, WarningRule};
use crate::error::{Result, TaroError};
use crate::events::EventBus;
use crate::id::InstanceIdGenerator;
use crate::registry::InstanceRegistry;

/// How long to keep draining output after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Owns the lifecycle of every instance it starts.
///
/// Each instance gets one supervision task; instances never share a lock.
pub struct Runner {
    defaults: JobDefaults,
    ids: InstanceIdGenerator,
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    slots: Option<Arc<Semaphore>>,
    started: Mutex<HashMap<InstanceId, Weak<JobInstance>>>,
}

impl Runner {
    pub fn new(defaults: &JobDefaults, registry: Arc<InstanceRegistry>, bus: Arc<EventBus>) -> Self {
        let slots = match defaults.max_concurrent {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            defaults: defaults.clone(),
            ids: InstanceIdGenerator::new(),
            registry,
            bus,
            slots,
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_id_generator(mut self, ids: InstanceIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Create, register and launch an instance. Must be called inside a tokio runtime.
    ///
    /// A program that cannot be resolved, or a warning rule with a bad pattern,
    /// fails the instance straight from CREATED.
    pub fn start(&self, definition: JobDefinition) -> Arc<JobInstance> {
        let id = self.ids.next(&definition.job_id);
        let grace = Duration::from_millis(
            definition
                .constraints
                .grace_period_ms
                .unwrap_or(self.defaults.grace_period_ms),
        );
        let capture = definition
            .constraints
            .capture_output
            .unwrap_or(self.defaults.capture_output);

        let rules = definition.output_rules().map(|_| ());
        let instance = JobInstance::create(id.clone(), definition, grace, capture, Arc::clone(&self.bus));
        self.registry.register(Arc::clone(&instance));
        self.track(&instance);

        match rules.and_then(|()| process::resolve_program(instance.definition())) {
            Ok(program) => {
                log::debug!("Starting {} ({})", id, program.display());
                tokio::spawn(supervise(Arc::clone(&instance), program, self.slots.clone()));
            }
            Err(e) => {
                log::warn!("Cannot start {}: {}", id, e);
                if let Err(err) = instance.finish(ExecutionState::Failed, None, Some(e.to_string())) {
                    log::error!("Failed to record start failure of {}: {}", id, err);
                }
            }
        }
        instance
    }

    /// Start an instance and wait for its terminal snapshot.
    pub async fn run(&self, definition: JobDefinition) -> InstanceSummary {
        let instance = self.start(definition);
        instance.wait().await;
        instance.summary()
    }

    fn track(&self, instance: &Arc<JobInstance>) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.retain(|_, weak| weak.strong_count() > 0);
        started.insert(instance.id().clone(), Arc::downgrade(instance));
    }

    /// Any instance this runner started that is still referenced somewhere.
    pub fn instance(&self, id: &InstanceId) -> Option<Arc<JobInstance>> {
        if let Some(instance) = self.registry.get_instance(id) {
            return Some(instance);
        }
        let started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.get(id).and_then(Weak::upgrade)
    }

    /// Stop an instance; a terminal instance reports its terminal state.
    pub fn stop(&self, id: &InstanceId) -> Result<ExecutionState> {
        self.instance(id)
            .map(|instance| instance.stop())
            .ok_or_else(|| TaroError::NotFound(id.to_string()))
    }

    pub fn signal(&self, id: &InstanceId, name: &str) -> Result<()> {
        self.instance(id)
            .ok_or_else(|| TaroError::NotFound(id.to_string()))?
            .signal(name)
    }

    pub fn release(&self, id: &InstanceId) -> Result<()> {
        self.instance(id)
            .ok_or_else(|| TaroError::NotFound(id.to_string()))?
            .release()
    }
}

/// Wait for the pending latch, then a concurrency slot.
async fn acquire(instance: &JobInstance, slots: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    instance.released().await;
    match slots {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    }
}

async fn supervise(instance: Arc<JobInstance>, program: PathBuf, slots: Option<Arc<Semaphore>>) {
    if instance.transition(ExecutionState::Pending).is_err() {
        // stopped while CREATED
        return;
    }

    let _permit = tokio::select! {
        _ = instance.stopping() => return,
        permit = acquire(&instance, slots) => permit,
    };

    let mut child = match instance.launch(&program) {
        Ok(Some(child)) => child,
        Ok(None) => return,
        Err(e) => {
            log::warn!("Failed to spawn {}: {}", instance.id(), e);
            return;
        }
    };

    let readers = spawn_output_readers(&instance, &mut child);
    spawn_exec_time_watchers(&instance);

    let (state, exit_code, reason) = tokio::select! {
        status = child.wait() => exited(&instance, status),
        _ = instance.stopping() => terminate(&instance, &mut child).await,
    };

    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            log::debug!("Output of {} still open after exit, abandoning it", instance.id());
            reader.abort();
        }
    }

    if let Err(e) = instance.finish(state, exit_code, reason) {
        log::error!("Failed to finish {}: {}", instance.id(), e);
    }
}

/// Outcome of an exit nobody waited on with a stop pending.
fn exited(
    instance: &JobInstance,
    status: std::io::Result<std::process::ExitStatus>,
) -> (ExecutionState, Option<i32>, Option<String>) {
    match status {
        Ok(status) => {
            let (code, reason) = process::describe_exit(status);
            if instance.stop_requested() {
                (ExecutionState::Stopped, code, Some("stopped".to_string()))
            } else if status.success() {
                (ExecutionState::Completed, code, None)
            } else {
                (ExecutionState::Failed, code, reason)
            }
        }
        Err(e) => (ExecutionState::Failed, None, Some(format!("wait failed: {}", e))),
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(instance: &JobInstance, child: &mut Child) -> (ExecutionState, Option<i32>, Option<String>) {
    let grace = instance.grace_period();
    if let Some(pid) = child.id()
        && let Err(e) = process::send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    {
        log::warn!("SIGTERM to {} failed: {}", instance.id(), e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            let (code, _) = process::describe_exit(status);
            (ExecutionState::Stopped, code, Some("stopped".to_string()))
        }
        Ok(Err(e)) => (ExecutionState::Stopped, None, Some(format!("stopped, wait failed: {}", e))),
        Err(_) => {
            log::warn!(
                "{} ignored SIGTERM for {}ms, killing",
                instance.id(),
                grace.as_millis()
            );
            if let Err(e) = child.kill().await {
                log::error!("Failed to kill {}: {}", instance.id(), e);
            }
            (
                ExecutionState::Interrupted,
                None,
                Some(format!("killed after {}ms grace period", grace.as_millis())),
            )
        }
    }
}

fn spawn_output_readers(instance: &Arc<JobInstance>, child: &mut Child) -> Vec<tokio::task::JoinHandle<()>> {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_output(Arc::clone(instance), stdout, "stdout")));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_output(Arc::clone(instance), stderr, "stderr")));
    }
    readers
}

async fn read_output<R: AsyncRead + Unpin>(instance: Arc<JobInstance>, pipe: R, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!("{} [{}] {}", instance.id(), stream, line);
                instance.output_line(&line);
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("Reading {} of {} failed: {}", stream, instance.id(), e);
                break;
            }
        }
    }
}

fn spawn_exec_time_watchers(instance: &Arc<JobInstance>) {
    for rule in &instance.definition().warnings {
        if let WarningRule::ExecTime { name, after_ms } = rule {
            let instance = Arc::clone(instance);
            let name = name.clone();
            let after = Duration::from_millis(*after_ms);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        if !instance.state().is_terminal() {
                            instance.add_warning(&name);
                        }
                    }
                    _ = instance.wait() => {}
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use tokio::sync::broadcast;

    fn runner_with(defaults: JobDefaults) -> (Runner, broadcast::Receiver<Event>) {
        let registry = Arc::new(InstanceRegistry::new());
        let bus = Arc::new(
            EventBus::builder()
                .terminal_observer(registry.clone())
                .build(),
        );
        let rx = bus.subscribe();
        let runner = Runner::new(&defaults, registry, bus)
            .with_id_generator(InstanceIdGenerator::with_token("test"));
        (runner, rx)
    }

    fn runner() -> (Runner, broadcast::Receiver<Event>) {
        runner_with(JobDefaults::default())
    }

    #[tokio::test]
    async fn test_completed_run() {
        let (runner, _rx) = runner();
        let summary = runner.run(JobDefinition::new("ok", "true")).await;
        assert_eq!(summary.state, ExecutionState::Completed);
        assert_eq!(summary.exit_code, Some(0));
        assert_eq!(summary.id.instance_id, "1-test");
        assert_eq!(
            summary.lifecycle.states(),
            vec![
                ExecutionState::Created,
                ExecutionState::Pending,
                ExecutionState::Running,
                ExecutionState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_from_created() {
        let (runner, _rx) = runner();
        let summary = runner.run(JobDefinition::new("bad", "taro-missing-binary-xyz")).await;
        assert_eq!(summary.state, ExecutionState::Failed);
        assert_eq!(
            summary.lifecycle.states(),
            vec![ExecutionState::Created, ExecutionState::Failed]
        );
        assert!(summary.failure.unwrap().contains("command not found"));
    }

    #[tokio::test]
    async fn test_status_is_last_output_line() {
        let (runner, _rx) = runner();
        let summary = runner
            .run(JobDefinition::new("echo", "sh").args(["-c", "echo first; echo last"]))
            .await;
        assert_eq!(summary.state, ExecutionState::Completed);
        assert_eq!(summary.status.as_deref(), Some("last"));
    }

    #[tokio::test]
    async fn test_held_instance_waits_for_release() {
        let (runner, _rx) = runner();
        let instance = runner.start(JobDefinition::new("held", "true").hold_pending(true));
        instance.wait_for_state(ExecutionState::Pending).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(instance.state(), ExecutionState::Pending);

        runner.release(instance.id()).unwrap();
        assert_eq!(instance.wait().await, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_max_concurrent_holds_second_instance() {
        let (runner, _rx) = runner_with(JobDefaults {
            max_concurrent: 1,
            ..JobDefaults::default()
        });
        let first = runner.start(JobDefinition::new("slot", "sleep").arg("0.3"));
        first.wait_for_state(ExecutionState::Running).await;
        let second = runner.start(JobDefinition::new("slot", "true"));
        second.wait_for_state(ExecutionState::Pending).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(second.state(), ExecutionState::Pending);

        assert_eq!(first.wait().await, ExecutionState::Completed);
        assert_eq!(second.wait().await, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_stop_terminal_reports_state() {
        let (runner, _rx) = runner();
        let instance = runner.start(JobDefinition::new("quick", "true"));
        instance.wait().await;
        assert_eq!(runner.stop(instance.id()).unwrap(), ExecutionState::Completed);
        assert!(matches!(
            runner.stop(&InstanceId::new("ghost", "9-x")),
            Err(TaroError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_time_warning() {
        let (runner, _rx) = runner();
        let summary = runner
            .run(
                JobDefinition::new("slow", "sleep")
                    .arg("0.3")
                    .warning(WarningRule::ExecTime {
                        name: "slow".to_string(),
                        after_ms: 50,
                    }),
            )
            .await;
        assert_eq!(summary.state, ExecutionState::Completed);
        assert_eq!(summary.warnings.get("slow"), Some(&1));
    }
}
