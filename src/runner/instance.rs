//! Live job instance: state, transitions and commands.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{Notify, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::process;
use crate::domain::{
    Event, ExecutionState, InstanceId, InstanceSummary, JobDefinition, Lifecycle, transition_payload,
};
use crate::error::{Result, TaroError};
use crate::events::EventBus;

#[derive(Debug, Default)]
struct InstanceState {
    lifecycle: Lifecycle,
    /// Sequence number of the next event
    sequence: u64,
    exit_code: Option<i32>,
    failure: Option<String>,
    status: Option<String>,
    warnings: BTreeMap<String, u32>,
    pid: Option<u32>,
    released: bool,
    stop_requested: bool,
}

impl InstanceState {
    fn current(&self) -> ExecutionState {
        self.lifecycle.state().unwrap_or(ExecutionState::Created)
    }
}

/// A job instance owned by the runner until it is terminal.
///
/// All mutation goes through one mutex, and every transition is published on the
/// bus while that mutex is held, so observers see transitions in lifecycle order.
pub struct JobInstance {
    id: InstanceId,
    definition: JobDefinition,
    command: String,
    grace_period: Duration,
    capture_output: bool,
    output_rules: Vec<(String, regex::Regex)>,
    bus: Arc<EventBus>,
    state: Mutex<InstanceState>,
    state_tx: watch::Sender<ExecutionState>,
    stop: CancellationToken,
    release: Notify,
}

impl std::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl JobInstance {
    /// Create the instance and emit its CREATED event.
    pub fn create(
        id: InstanceId,
        definition: JobDefinition,
        grace_period: Duration,
        capture_output: bool,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let output_rules = definition.output_rules().unwrap_or_else(|e| {
            log::warn!("Ignoring output rules of {}: {}", id, e);
            Vec::new()
        });

        let (state_tx, _) = watch::channel(ExecutionState::Created);
        let instance = Arc::new(Self {
            command: definition.command_line(),
            id,
            definition,
            grace_period,
            capture_output,
            output_rules,
            bus,
            state: Mutex::new(InstanceState::default()),
            state_tx,
            stop: CancellationToken::new(),
            release: Notify::new(),
        });

        {
            let mut st = instance.lock();
            if let Err(e) = instance.transition_locked(&mut st, ExecutionState::Created, Value::Null) {
                log::error!("Failed to create {}: {}", instance.id, e);
            }
        }
        instance
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, st: &InstanceState) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            state: st.current(),
            lifecycle: st.lifecycle.clone(),
            exit_code: st.exit_code,
            failure: st.failure.clone(),
            status: st.status.clone(),
            warnings: st.warnings.clone(),
            pid: st.pid,
            command: self.command.clone(),
        }
    }

    /// Record, publish, then wake waiters. Caller holds the state lock.
    fn transition_locked(&self, st: &mut InstanceState, new_state: ExecutionState, payload: Value) -> Result<()> {
        let previous = st.lifecycle.state();
        let now = Utc::now();
        st.lifecycle.record(new_state, now)?;

        let event = Event::new(self.id.clone(), st.sequence, previous, new_state, now, payload);
        st.sequence += 1;

        let snapshot = self.snapshot(st);
        self.bus.publish(&event, &snapshot);
        self.state_tx.send_replace(new_state);
        Ok(())
    }

    pub(crate) fn transition(&self, new_state: ExecutionState) -> Result<()> {
        let mut st = self.lock();
        self.transition_locked(&mut st, new_state, Value::Null)
    }

    /// Move to a terminal state with exit details.
    pub(crate) fn finish(&self, state: ExecutionState, exit_code: Option<i32>, reason: Option<String>) -> Result<()> {
        let mut st = self.lock();
        st.exit_code = exit_code;
        if state.is_failure() {
            st.failure = reason.clone();
        }
        let payload = transition_payload(None, exit_code, reason.as_deref());
        self.transition_locked(&mut st, state, payload)
    }

    /// Spawn the process and enter RUNNING under one lock, so a concurrent stop
    /// either prevents the spawn or sees RUNNING with a pid.
    ///
    /// Returns `Ok(None)` when the instance left PENDING in the meantime.
    pub(crate) fn launch(&self, program: &Path) -> Result<Option<Child>> {
        let mut st = self.lock();
        if st.current() != ExecutionState::Pending {
            return Ok(None);
        }
        match process::spawn(&self.definition, program, self.capture_output) {
            Ok(child) => {
                st.pid = child.id();
                let payload = transition_payload(st.pid, None, None);
                self.transition_locked(&mut st, ExecutionState::Running, payload)?;
                Ok(Some(child))
            }
            Err(e) => {
                let reason = e.to_string();
                st.failure = Some(reason.clone());
                self.transition_locked(&mut st, ExecutionState::Failed, transition_payload(None, None, Some(&reason)))?;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn capture_output(&self) -> bool {
        self.capture_output
    }

    pub fn state(&self) -> ExecutionState {
        *self.state_tx.borrow()
    }

    pub fn summary(&self) -> InstanceSummary {
        let st = self.lock();
        self.snapshot(&st)
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Resolves once a stop has been requested.
    pub fn stopping(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    /// Request a stop. Idempotent; returns the state right after the request.
    ///
    /// Before execution the instance goes straight to STOPPED. While running,
    /// the supervision task delivers SIGTERM and enforces the grace period.
    pub fn stop(&self) -> ExecutionState {
        let mut st = self.lock();
        let current = st.current();
        match current {
            ExecutionState::Created | ExecutionState::Pending => {
                st.stop_requested = true;
                let payload = transition_payload(None, None, Some("stopped before execution"));
                if let Err(e) = self.transition_locked(&mut st, ExecutionState::Stopped, payload) {
                    log::error!("Failed to stop {}: {}", self.id, e);
                }
                self.stop.cancel();
                st.current()
            }
            ExecutionState::Running => {
                if !st.stop_requested {
                    log::info!("Stopping {}", self.id);
                    st.stop_requested = true;
                    self.stop.cancel();
                }
                current
            }
            _ => current,
        }
    }

    /// Deliver a signal to the running process. State is unchanged.
    pub fn signal(&self, name: &str) -> Result<()> {
        let signal = process::parse_signal(name)?;
        let st = self.lock();
        let current = st.current();
        if current != ExecutionState::Running {
            return Err(TaroError::CommandRejected(format!(
                "{} is {}, signals need RUNNING",
                self.id, current
            )));
        }
        let pid = st
            .pid
            .ok_or_else(|| TaroError::CommandRejected(format!("{} has no pid", self.id)))?;
        log::info!("Sending {} to {} (pid {})", signal, self.id, pid);
        process::send_signal(pid, signal)
    }

    /// Open the pending latch.
    pub fn release(&self) -> Result<()> {
        let mut st = self.lock();
        let current = st.current();
        if current != ExecutionState::Pending {
            return Err(TaroError::CommandRejected(format!(
                "{} is {}, only PENDING instances can be released",
                self.id, current
            )));
        }
        if !st.released {
            log::info!("Releasing {}", self.id);
            st.released = true;
            self.release.notify_one();
        }
        Ok(())
    }

    /// Resolves once the latch is open (immediately unless `hold_pending`).
    pub(crate) async fn released(&self) {
        if !self.definition.constraints.hold_pending {
            return;
        }
        loop {
            if self.lock().released {
                return;
            }
            self.release.notified().await;
        }
    }

    /// Count a warning and tell plugins. Never changes the execution state.
    pub fn add_warning(&self, name: &str) {
        let snapshot = {
            let mut st = self.lock();
            let count = st.warnings.entry(name.to_string()).or_insert(0);
            *count += 1;
            log::warn!("Warning '{}' on {} (count {})", name, self.id, count);
            self.snapshot(&st)
        };
        self.bus.warning(&snapshot, name);
    }

    /// Record a captured output line as the status, hand it to plugins and
    /// apply output rules.
    pub fn output_line(&self, line: &str) {
        self.lock().status = Some(line.to_string());
        self.bus.output(&self.id, line);
        for (name, pattern) in &self.output_rules {
            if pattern.is_match(line) {
                self.add_warning(name);
            }
        }
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> ExecutionState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait until `state` is reached, or any terminal state.
    pub async fn wait_for_state(&self, state: ExecutionState) -> ExecutionState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|s| *s == state || s.is_terminal()).await {
            Ok(reached) => *reached,
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WarningRule;

    fn instance(def: JobDefinition) -> (Arc<JobInstance>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::builder().build());
        let inst = JobInstance::create(
            InstanceId::new(def.job_id.clone(), "1-t"),
            def,
            Duration::from_millis(100),
            true,
            Arc::clone(&bus),
        );
        (inst, bus)
    }

    #[test]
    fn test_created_on_construction() {
        let (inst, _bus) = instance(JobDefinition::new("j", "true"));
        assert_eq!(inst.state(), ExecutionState::Created);
        let summary = inst.summary();
        assert_eq!(summary.lifecycle.states(), vec![ExecutionState::Created]);
        assert_eq!(summary.command, "true");
    }

    #[test]
    fn test_stop_before_execution() {
        let (inst, bus) = instance(JobDefinition::new("j", "true"));
        let mut rx = bus.subscribe();
        inst.transition(ExecutionState::Pending).unwrap();

        assert_eq!(inst.stop(), ExecutionState::Stopped);
        assert_eq!(inst.stop(), ExecutionState::Stopped);

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.new_state)
            .collect();
        assert_eq!(states, vec![ExecutionState::Pending, ExecutionState::Stopped]);
    }

    #[test]
    fn test_event_sequences_increment() {
        let (inst, bus) = instance(JobDefinition::new("j", "true"));
        let mut rx = bus.subscribe();
        inst.transition(ExecutionState::Pending).unwrap();
        inst.finish(ExecutionState::Failed, None, Some("boom".to_string())).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.reason(), Some("boom"));
        assert_eq!(inst.summary().failure.as_deref(), Some("boom"));
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let (inst, _bus) = instance(JobDefinition::new("j", "true"));
        inst.finish(ExecutionState::Failed, None, Some("x".to_string())).unwrap();
        assert!(inst.transition(ExecutionState::Pending).is_err());
        assert_eq!(inst.stop(), ExecutionState::Failed);
    }

    #[test]
    fn test_release_requires_pending() {
        let (inst, _bus) = instance(JobDefinition::new("j", "true").hold_pending(true));
        assert!(matches!(inst.release(), Err(TaroError::CommandRejected(_))));
        inst.transition(ExecutionState::Pending).unwrap();
        assert!(inst.release().is_ok());
    }

    #[test]
    fn test_signal_requires_running() {
        let (inst, _bus) = instance(JobDefinition::new("j", "true"));
        assert!(matches!(inst.signal("TERM"), Err(TaroError::CommandRejected(_))));
        assert!(matches!(inst.signal("BOGUS"), Err(TaroError::CommandRejected(_))));
    }

    #[test]
    fn test_output_rules_count_warnings() {
        let def = JobDefinition::new("j", "true").warning(WarningRule::OutputMatches {
            name: "error_output".to_string(),
            pattern: "ERROR".to_string(),
        });
        let (inst, _bus) = instance(def);
        inst.output_line("all good");
        inst.output_line("ERROR: disk full");
        inst.output_line("another ERROR");

        let summary = inst.summary();
        assert_eq!(summary.status.as_deref(), Some("another ERROR"));
        assert_eq!(summary.warnings.get("error_output"), Some(&2));
        assert_eq!(summary.state, ExecutionState::Created);
    }

    #[derive(Default)]
    struct Seen {
        lines: Mutex<Vec<String>>,
        warnings: Mutex<Vec<(String, u32)>>,
    }

    impl crate::events::JobPlugin for Seen {
        fn name(&self) -> &str {
            "seen"
        }

        fn on_warning(&self, instance: &InstanceSummary, warning: &str) -> Result<()> {
            let count = instance.warnings.get(warning).copied().unwrap_or(0);
            self.warnings.lock().unwrap().push((warning.to_string(), count));
            Ok(())
        }

        fn on_output(&self, _instance: &InstanceId, line: &str) -> Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_output_and_warnings_reach_plugins() {
        let seen = Arc::new(Seen::default());
        let mut plugins = crate::events::PluginRegistry::new();
        plugins.register(seen.clone());
        let bus = Arc::new(EventBus::builder().plugins(plugins).build());
        let def = JobDefinition::new("j", "true").warning(WarningRule::OutputMatches {
            name: "error_output".to_string(),
            pattern: "ERROR".to_string(),
        });
        let inst = JobInstance::create(
            InstanceId::new("j", "1-t"),
            def,
            Duration::from_millis(100),
            true,
            bus,
        );

        inst.output_line("starting");
        inst.output_line("12:00 ERROR disk");
        inst.add_warning("manual");

        assert_eq!(*seen.lines.lock().unwrap(), vec!["starting", "12:00 ERROR disk"]);
        assert_eq!(
            *seen.warnings.lock().unwrap(),
            vec![("error_output".to_string(), 1), ("manual".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let (inst, _bus) = instance(JobDefinition::new("j", "true"));
        let waiter = {
            let inst = Arc::clone(&inst);
            tokio::spawn(async move { inst.wait().await })
        };
        inst.transition(ExecutionState::Pending).unwrap();
        assert_eq!(inst.wait_for_state(ExecutionState::Pending).await, ExecutionState::Pending);
        inst.stop();
        assert_eq!(waiter.await.unwrap(), ExecutionState::Stopped);
    }
}
