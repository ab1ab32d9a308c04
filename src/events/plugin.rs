//! In-process plugin hooks run on every transition, warning and output line.

use std::collections::HashMap;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::domain::{ExecutionState, InstanceId, InstanceSummary};
use crate::error::Result;

/// A single transition as seen by plugins.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    /// Snapshot taken right after the transition
    pub instance: &'a InstanceSummary,
    pub previous: Option<ExecutionState>,
    pub new_state: ExecutionState,
}

/// Statically registered lifecycle hooks. Every hook defaults to a no-op.
pub trait JobPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_created(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_pending(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_running(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_completed(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_failed(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_stopped(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    fn on_interrupted(&self, _t: &Transition<'_>) -> Result<()> {
        Ok(())
    }

    /// A warning was counted; `instance` already includes it.
    fn on_warning(&self, _instance: &InstanceSummary, _warning: &str) -> Result<()> {
        Ok(())
    }

    /// A line of captured output, without its newline.
    fn on_output(&self, _instance: &InstanceId, _line: &str) -> Result<()> {
        Ok(())
    }
}

fn dispatch(plugin: &dyn JobPlugin, t: &Transition<'_>) -> Result<()> {
    match t.new_state {
        ExecutionState::Created => plugin.on_created(t),
        ExecutionState::Pending => plugin.on_pending(t),
        ExecutionState::Running => plugin.on_running(t),
        ExecutionState::Completed => plugin.on_completed(t),
        ExecutionState::Failed => plugin.on_failed(t),
        ExecutionState::Stopped => plugin.on_stopped(t),
        ExecutionState::Interrupted => plugin.on_interrupted(t),
    }
}

/// Built-in plugin writing one structured record per transition.
#[derive(Debug, Default)]
pub struct LogPlugin;

impl LogPlugin {
    fn record(&self, t: &Transition<'_>) {
        let id = &t.instance.id;
        let previous = t.previous.map(|s| s.name()).unwrap_or("-");
        if t.new_state.is_failure() {
            tracing::warn!(
                target: "taro::transition",
                job_id = %id.job_id,
                instance_id = %id.instance_id,
                previous,
                new_state = %t.new_state,
                exit_code = ?t.instance.exit_code,
                failure = ?t.instance.failure,
                "job instance failed"
            );
        } else {
            tracing::info!(
                target: "taro::transition",
                job_id = %id.job_id,
                instance_id = %id.instance_id,
                previous,
                new_state = %t.new_state,
                pid = ?t.instance.pid,
                "job instance transition"
            );
        }
    }
}

impl JobPlugin for LogPlugin {
    fn name(&self) -> &str {
        "log"
    }

    fn on_created(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_pending(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_running(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_completed(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_failed(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_stopped(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_interrupted(&self, t: &Transition<'_>) -> Result<()> {
        self.record(t);
        Ok(())
    }

    fn on_warning(&self, instance: &InstanceSummary, warning: &str) -> Result<()> {
        tracing::warn!(
            target: "taro::warning",
            job_id = %instance.id.job_id,
            instance_id = %instance.id.instance_id,
            warning,
            count = instance.warnings.get(warning).copied().unwrap_or(0),
            "job instance warning"
        );
        Ok(())
    }
}

/// Built-in plugin copying captured output lines to a writer.
pub struct EchoPlugin {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EchoPlugin {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl JobPlugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_output(&self, _instance: &InstanceId, line: &str) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

type PluginFactory = fn() -> Arc<dyn JobPlugin>;

fn log_plugin() -> Arc<dyn JobPlugin> {
    Arc::new(LogPlugin)
}

fn echo_plugin() -> Arc<dyn JobPlugin> {
    Arc::new(EchoPlugin::stdout())
}

fn builtin_plugins() -> HashMap<&'static str, PluginFactory> {
    let mut builtins: HashMap<&'static str, PluginFactory> = HashMap::new();
    builtins.insert("log", log_plugin);
    builtins.insert("echo", echo_plugin);
    builtins
}

/// Ordered set of plugins notified on every transition, warning and output line.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn JobPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select built-in plugins by name. Unknown names are logged and skipped.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let builtins = builtin_plugins();
        let mut registry = Self::new();
        for name in names {
            match builtins.get(name.as_ref()) {
                Some(factory) => registry.register(factory()),
                None => log::warn!("Unknown plugin '{}', skipping", name.as_ref()),
            }
        }
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn JobPlugin>) {
        log::debug!("Registered plugin '{}'", plugin.name());
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Call `hook` on every plugin in order. Errors and panics stay here.
    fn each<F>(&self, what: &str, instance: &InstanceId, hook: F)
    where
        F: Fn(&dyn JobPlugin) -> Result<()>,
    {
        for plugin in &self.plugins {
            match catch_unwind(AssertUnwindSafe(|| hook(plugin.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Plugin '{}' failed on {} for {}: {}", plugin.name(), what, instance, e),
                Err(_) => log::error!("Plugin '{}' panicked on {} for {}", plugin.name(), what, instance),
            }
        }
    }

    /// Run every plugin's hook for this transition.
    pub fn notify(&self, t: &Transition<'_>) {
        self.each(t.new_state.name(), &t.instance.id, |plugin| dispatch(plugin, t));
    }

    pub fn notify_warning(&self, instance: &InstanceSummary, warning: &str) {
        self.each("warning", &instance.id, |plugin| plugin.on_warning(instance, warning));
    }

    pub fn notify_output(&self, instance: &InstanceId, line: &str) {
        self.each("output", instance, |plugin| plugin.on_output(instance, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InstanceId, Lifecycle};
    use crate::error::TaroError;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn summary() -> InstanceSummary {
        let mut lifecycle = Lifecycle::new();
        lifecycle.record(ExecutionState::Created, Utc::now()).unwrap();
        InstanceSummary {
            id: InstanceId::new("job", "1-a"),
            state: ExecutionState::Created,
            lifecycle,
            exit_code: None,
            failure: None,
            status: None,
            warnings: BTreeMap::new(),
            pid: None,
            command: "true".to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ExecutionState>>,
        warnings: Mutex<Vec<String>>,
        lines: Mutex<Vec<String>>,
    }

    impl JobPlugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_created(&self, t: &Transition<'_>) -> Result<()> {
            self.seen.lock().unwrap().push(t.new_state);
            Ok(())
        }

        fn on_stopped(&self, t: &Transition<'_>) -> Result<()> {
            self.seen.lock().unwrap().push(t.new_state);
            Ok(())
        }

        fn on_warning(&self, _instance: &InstanceSummary, warning: &str) -> Result<()> {
            self.warnings.lock().unwrap().push(warning.to_string());
            Ok(())
        }

        fn on_output(&self, _instance: &InstanceId, line: &str) -> Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl JobPlugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_created(&self, _t: &Transition<'_>) -> Result<()> {
            Err(TaroError::Plugin("boom".to_string()))
        }
    }

    struct Panicking;

    impl JobPlugin for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_created(&self, _t: &Transition<'_>) -> Result<()> {
            panic!("plugin bug");
        }

        fn on_output(&self, _instance: &InstanceId, _line: &str) -> Result<()> {
            panic!("plugin bug");
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_from_names_skips_unknown() {
        let registry = PluginRegistry::from_names(&["log", "nope", "echo"]);
        assert_eq!(registry.names(), vec!["log", "echo"]);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_warning_and_output_hooks() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Panicking));
        registry.register(recorder.clone());

        let s = summary();
        registry.notify_output(&s.id, "12:00 ERROR disk");
        registry.notify_warning(&s, "error_output");

        assert_eq!(*recorder.lines.lock().unwrap(), vec!["12:00 ERROR disk"]);
        assert_eq!(*recorder.warnings.lock().unwrap(), vec!["error_output"]);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_echo_writes_lines() {
        let captured = Captured::default();
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(EchoPlugin::new(captured.clone())));

        let s = summary();
        registry.notify_output(&s.id, "first");
        registry.notify_output(&s.id, "second");
        assert_eq!(String::from_utf8(captured.0.lock().unwrap().clone()).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_hooks_dispatch_by_state() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(recorder.clone());

        let s = summary();
        for state in [ExecutionState::Created, ExecutionState::Pending, ExecutionState::Stopped] {
            registry.notify(&Transition {
                instance: &s,
                previous: None,
                new_state: state,
            });
        }
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![ExecutionState::Created, ExecutionState::Stopped]
        );
    }

    #[test]
    fn test_failures_do_not_stop_other_plugins() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Panicking));
        registry.register(recorder.clone());

        let s = summary();
        registry.notify(&Transition {
            instance: &s,
            previous: None,
            new_state: ExecutionState::Created,
        });
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }
}
