//! OS process plumbing: program lookup, spawning and signal delivery.

use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::domain::JobDefinition;
use crate::error::{Result, TaroError};

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate the program the way `execvp` would: paths with a slash are taken as
/// is (relative to the working dir), bare names are searched on `PATH`.
pub fn resolve_program(def: &JobDefinition) -> Result<PathBuf> {
    let program = def.program.as_str();
    if program.is_empty() {
        return Err(TaroError::StartFailure("empty program".to_string()));
    }

    if program.contains('/') {
        let path = match &def.working_dir {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(TaroError::StartFailure(format!(
            "{}: no such executable",
            path.display()
        )));
    }

    let search_path: Option<OsString> = def
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    search_path
        .iter()
        .flat_map(|paths| std::env::split_paths(paths))
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| TaroError::StartFailure(format!("{}: command not found", program)))
}

/// Spawn the resolved program with the definition's args, env and working dir.
pub fn spawn(def: &JobDefinition, program: &Path, capture_output: bool) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(&def.args).envs(&def.env).stdin(Stdio::null()).kill_on_drop(true);

    if let Some(dir) = &def.working_dir {
        cmd.current_dir(dir);
    }

    if capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    cmd.spawn()
        .map_err(|e| TaroError::StartFailure(format!("{}: {}", program.display(), e)))
}

/// Parse `TERM`, `sigterm`, `SIGUSR1` or a number like `9`.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| TaroError::CommandRejected(format!("unknown signal number {}", number)));
    }

    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| TaroError::CommandRejected(format!("unknown signal '{}'", name)))
}

pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| TaroError::CommandRejected(format!("invalid pid {}", pid)))?;
    kill(Pid::from_raw(raw), signal)
        .map_err(|e| TaroError::CommandRejected(format!("failed to send {} to {}: {}", signal, pid, e)))
}

/// Exit code and, for anything but a clean exit, a readable reason.
pub fn describe_exit(status: ExitStatus) -> (Option<i32>, Option<String>) {
    match (status.code(), status.signal()) {
        (Some(0), _) => (Some(0), None),
        (Some(code), _) => (Some(code), Some(format!("exit code {}", code))),
        (None, Some(sig)) => {
            let name = Signal::try_from(sig)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| sig.to_string());
            (None, Some(format!("terminated by {}", name)))
        }
        (None, None) => (None, Some("terminated".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigusr1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_signal_rejects_unknown() {
        assert!(matches!(parse_signal("NOPE"), Err(TaroError::CommandRejected(_))));
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn test_resolve_on_path() {
        let def = JobDefinition::new("j", "sh");
        let path = resolve_program(&def).unwrap();
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_missing_program() {
        let def = JobDefinition::new("j", "taro-no-such-program-xyz");
        assert!(matches!(resolve_program(&def), Err(TaroError::StartFailure(_))));

        let def = JobDefinition::new("j", "/nonexistent/bin/tool");
        assert!(resolve_program(&def).is_err());

        assert!(resolve_program(&JobDefinition::new("j", "")).is_err());
    }

    #[test]
    fn test_resolve_non_executable_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("data.txt");
        std::fs::write(&file, "x").unwrap();
        let def = JobDefinition::new("j", file.display().to_string());
        assert!(resolve_program(&def).is_err());
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(describe_exit(ExitStatus::from_raw(0)), (Some(0), None));
        let (code, reason) = describe_exit(ExitStatus::from_raw(3 << 8));
        assert_eq!(code, Some(3));
        assert_eq!(reason.as_deref(), Some("exit code 3"));
        let (code, reason) = describe_exit(ExitStatus::from_raw(9));
        assert_eq!(code, None);
        assert_eq!(reason.as_deref(), Some("terminated by SIGKILL"));
    }
}
