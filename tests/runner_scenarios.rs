//! Runner integration tests
//!
//! Drive real processes through the public API and check what observers see.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taro::config::JobDefaults;
use taro::domain::{Event, ExecutionState, InstanceId, JobDefinition, WarningRule};
use taro::error::TaroError;
use taro::events::{EchoPlugin, EventBus, PluginRegistry};
use taro::registry::InstanceRegistry;
use taro::runner::Runner;
use taro::storage::{JsonlPersistence, Persistence, RecordQuery};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    runner: Runner,
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    persistence: Arc<JsonlPersistence>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(InstanceRegistry::new());
    let persistence = Arc::new(JsonlPersistence::new(dir.path().join("history.jsonl")).unwrap());
    let bus = Arc::new(
        EventBus::builder()
            .terminal_observer(registry.clone())
            .persistence(persistence.clone())
            .build(),
    );
    let defaults = JobDefaults {
        grace_period_ms: 300,
        ..Default::default()
    };
    let runner = Runner::new(&defaults, Arc::clone(&registry), Arc::clone(&bus));
    Harness {
        runner,
        registry,
        bus,
        persistence,
        _dir: dir,
    }
}

/// States published for `id`, up to and including the terminal one
async fn observed_states(rx: &mut broadcast::Receiver<Event>, id: &InstanceId) -> Vec<ExecutionState> {
    let mut states = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("bus open");
        if &event.instance_id != id {
            continue;
        }
        states.push(event.new_state);
        if event.is_terminal() {
            return states;
        }
    }
}

fn persisted(h: &Harness) -> Vec<taro::domain::InstanceSummary> {
    h.persistence
        .query(&RecordQuery::all())
        .unwrap()
        .collect::<taro::Result<Vec<_>>>()
        .unwrap()
}

#[tokio::test]
async fn test_successful_run_lifecycle_and_record() {
    let h = harness();
    let mut rx = h.bus.subscribe();

    let instance = h.runner.start(JobDefinition::new("greet", "sh").arg("-c").arg("echo hello"));
    let states = observed_states(&mut rx, instance.id()).await;

    assert_eq!(
        states,
        vec![
            ExecutionState::Created,
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::Completed,
        ]
    );
    assert_eq!(instance.wait().await, ExecutionState::Completed);

    let summary = instance.summary();
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.status.as_deref(), Some("hello"));
    assert_eq!(summary.lifecycle.states(), states);

    let records = persisted(&h);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, *instance.id());
    assert_eq!(records[0].exit_code, Some(0));
    assert!(h.registry.get(instance.id()).is_none());
}

#[tokio::test]
async fn test_stop_while_pending() {
    let h = harness();
    let mut rx = h.bus.subscribe();

    let instance = h.runner.start(JobDefinition::new("held", "sleep").arg("5").hold_pending(true));
    assert_eq!(
        instance.wait_for_state(ExecutionState::Pending).await,
        ExecutionState::Pending
    );

    assert_eq!(h.runner.stop(instance.id()).unwrap(), ExecutionState::Stopped);
    let states = observed_states(&mut rx, instance.id()).await;
    assert_eq!(
        states,
        vec![
            ExecutionState::Created,
            ExecutionState::Pending,
            ExecutionState::Stopped,
        ]
    );
    assert!(!states.contains(&ExecutionState::Running));

    // stop is idempotent once terminal
    assert_eq!(h.runner.stop(instance.id()).unwrap(), ExecutionState::Stopped);
    assert_eq!(persisted(&h).len(), 1);
}

#[tokio::test]
async fn test_stop_ignoring_term_is_interrupted() {
    let h = harness();
    let instance = h.runner.start(
        JobDefinition::new("stubborn", "sh")
            .arg("-c")
            .arg("trap '' TERM; echo ready; sleep 5")
            .grace_period_ms(200),
    );
    assert_eq!(
        instance.wait_for_state(ExecutionState::Running).await,
        ExecutionState::Running
    );
    // let the shell install its trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(instance.stop(), ExecutionState::Running);
    assert_eq!(instance.stop(), ExecutionState::Running);
    let state = tokio::time::timeout(Duration::from_secs(5), instance.wait())
        .await
        .expect("killed after grace period");
    assert_eq!(state, ExecutionState::Interrupted);
}

#[tokio::test]
async fn test_stop_running_within_grace_is_stopped() {
    let h = harness();
    let instance = h.runner.start(JobDefinition::new("sleeper", "sleep").arg("5"));
    instance.wait_for_state(ExecutionState::Running).await;

    instance.stop();
    let state = tokio::time::timeout(Duration::from_secs(5), instance.wait())
        .await
        .expect("terminated");
    assert_eq!(state, ExecutionState::Stopped);
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_code() {
    let h = harness();
    let summary = h.runner.run(JobDefinition::new("broken", "sh").arg("-c").arg("exit 3")).await;
    assert_eq!(summary.state, ExecutionState::Failed);
    assert_eq!(summary.exit_code, Some(3));
    assert_eq!(persisted(&h)[0].exit_code, Some(3));
}

#[tokio::test]
async fn test_missing_executable_fails_from_created() {
    let h = harness();
    let mut rx = h.bus.subscribe();
    let instance = h.runner.start(JobDefinition::new("ghost", "/nonexistent/taro-no-such-program"));
    let states = observed_states(&mut rx, instance.id()).await;

    assert_eq!(states, vec![ExecutionState::Created, ExecutionState::Failed]);
    assert!(instance.summary().failure.is_some());
    assert_eq!(persisted(&h).len(), 1);
}

#[tokio::test]
async fn test_signal_is_delivered() {
    let h = harness();
    let instance = h.runner.start(
        JobDefinition::new("waiter", "sh")
            .arg("-c")
            .arg("trap 'echo got-usr1; exit 0' USR1; while true; do sleep 0.1; done"),
    );
    instance.wait_for_state(ExecutionState::Running).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.runner.signal(instance.id(), "USR1").unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), instance.wait())
        .await
        .expect("exited after signal");
    assert_eq!(state, ExecutionState::Completed);
    assert_eq!(instance.summary().status.as_deref(), Some("got-usr1"));
}

#[tokio::test]
async fn test_release_requires_pending() {
    let h = harness();
    let instance = h.runner.start(JobDefinition::new("sleeper", "sleep").arg("5"));
    instance.wait_for_state(ExecutionState::Running).await;

    let result = h.runner.release(instance.id());
    assert!(matches!(result, Err(TaroError::CommandRejected(_))));
    assert_eq!(instance.state(), ExecutionState::Running);

    instance.stop();
    instance.wait().await;
}

#[tokio::test]
async fn test_held_instance_runs_after_release() {
    let h = harness();
    let instance = h.runner.start(JobDefinition::new("gated", "true").hold_pending(true));
    instance.wait_for_state(ExecutionState::Pending).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(instance.state(), ExecutionState::Pending);

    h.runner.release(instance.id()).unwrap();
    assert_eq!(instance.wait().await, ExecutionState::Completed);
}

#[tokio::test]
async fn test_output_warnings_are_counted() {
    let h = harness();
    let summary = h
        .runner
        .run(
            JobDefinition::new("noisy", "sh")
                .arg("-c")
                .arg("echo '12:00 ERROR disk full'; echo fine; echo 'ERROR again'; echo 'no errors'")
                .warning(WarningRule::OutputMatches {
                    name: "error_output".to_string(),
                    pattern: "ERROR".to_string(),
                }),
        )
        .await;

    assert_eq!(summary.state, ExecutionState::Completed);
    assert_eq!(summary.warnings.get("error_output"), Some(&2));
    assert_eq!(summary.warning_count(), 2);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_captured_output_is_echoed() {
    let captured = Captured::default();
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(EchoPlugin::new(captured.clone())));
    let registry = Arc::new(InstanceRegistry::new());
    let bus = Arc::new(
        EventBus::builder()
            .plugins(plugins)
            .terminal_observer(registry.clone())
            .build(),
    );
    let runner = Runner::new(&JobDefaults::default(), registry, bus);

    let summary = runner
        .run(JobDefinition::new("chatty", "sh").arg("-c").arg("echo one; echo two"))
        .await;

    assert_eq!(summary.state, ExecutionState::Completed);
    assert_eq!(captured.text(), "one\ntwo\n");
    assert_eq!(summary.status.as_deref(), Some("two"));
}

#[tokio::test]
async fn test_output_after_exit_is_abandoned() {
    let h = harness();
    let instance = h.runner.start(
        JobDefinition::new("forker", "sh")
            .arg("-c")
            .arg("(sleep 0.6; echo late) & echo done"),
    );
    assert_eq!(instance.wait().await, ExecutionState::Completed);
    assert_eq!(instance.summary().status.as_deref(), Some("done"));

    // the background child still holds the pipe and writes after the exit
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(instance.summary().status.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_bad_output_pattern_fails_from_created() {
    let h = harness();
    let summary = h
        .runner
        .run(JobDefinition::new("misconfigured", "true").warning(WarningRule::OutputMatches {
            name: "broken".to_string(),
            pattern: "(unclosed".to_string(),
        }))
        .await;

    assert_eq!(summary.state, ExecutionState::Failed);
    assert_eq!(
        summary.lifecycle.states(),
        vec![ExecutionState::Created, ExecutionState::Failed]
    );
    assert!(summary.failure.as_deref().is_some_and(|f| f.contains("bad pattern")));
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let h = harness();
    let id = InstanceId::new("nope", "1-a");
    assert!(matches!(h.runner.stop(&id), Err(TaroError::NotFound(_))));
    assert!(matches!(h.runner.signal(&id, "TERM"), Err(TaroError::NotFound(_))));
}
