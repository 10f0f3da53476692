use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::process::runner::apply_env;

/// Process-table operations the supervisor needs. Processes are identified by
/// a substring of their full command line (usually the absolute binary path),
/// never by executable name alone.
pub trait ProcessControl: Send + Sync {
    fn is_running(&self, signature: &str) -> bool;
    fn kill_matching(&self, signature: &str) -> usize;
    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, Option<String>)],
        trace_id: &str,
    ) -> Result<u32, AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl SystemProcesses {
    fn snapshot() -> System {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        sys
    }

    /// Matching processes, excluding threads and this process.
    fn matching<'a>(sys: &'a System, signature: &'a str) -> impl Iterator<Item = &'a Process> + 'a {
        let own_pid = std::process::id();
        sys.processes().values().filter(move |process| {
            process.thread_kind().is_none()
                && process.pid().as_u32() != own_pid
                && cmdline_matches(&joined_cmd(process), signature)
        })
    }
}

impl ProcessControl for SystemProcesses {
    fn is_running(&self, signature: &str) -> bool {
        let sys = Self::snapshot();
        let found = Self::matching(&sys, signature).next().is_some();
        found
    }

    fn kill_matching(&self, signature: &str) -> usize {
        let sys = Self::snapshot();
        let killed = Self::matching(&sys, signature)
            .filter(|process| process.kill_with(Signal::Kill).unwrap_or(false))
            .count();
        if killed > 0 {
            debug!(signature = %signature, killed, "killed stale processes");
        }
        killed
    }

    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, Option<String>)],
        trace_id: &str,
    ) -> Result<u32, AppError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        apply_env(&mut command, env);
        let mut child = command
            .spawn()
            .map_err(|err| AppError::spawn(format!("Failed to start {program}: {err}"), trace_id))?;
        let pid = child.id();
        // Reap on exit so restarts do not leave zombies behind.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
}

pub fn cmdline_matches(cmdline: &str, signature: &str) -> bool {
    !signature.is_empty() && cmdline.contains(signature)
}

/// Command line as `ps` shows it, arguments joined by single spaces.
fn joined_cmd(process: &Process) -> String {
    process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;
    if let Err(err) = kill(Pid::from_raw(child.id() as i32), NixSignal::SIGTERM) {
        debug!(pid = child.id(), error = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.kill();
}

/// Polite stop first; forced kill once `grace` runs out. Returns the exit code if known.
pub fn terminate_child(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }
    request_stop(child);
    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => thread::sleep(Duration::from_millis(25)),
            Err(_) => break,
        }
    }
    warn!(pid = child.id(), "process ignored SIGTERM; killing");
    let _ = child.kill();
    child.wait().ok().and_then(|status| status.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_by_substring_not_name() {
        let cmdline = "/home/u/.local/share/althea/AltServer -u abc";
        assert!(cmdline_matches(cmdline, "/home/u/.local/share/althea/AltServer"));
        assert!(!cmdline_matches("/usr/bin/AltServer-other", "/home/u/.local/share/althea/AltServer"));
        assert!(!cmdline_matches(cmdline, ""));
    }

    #[cfg(unix)]
    #[test]
    fn finds_and_kills_process_by_signature() {
        let marker = format!("althea-test-marker-{}", std::process::id());
        // The trailing echo keeps sh alive (no exec) with the marker in its cmdline.
        let mut child = Command::new("sh")
            .args(["-c", &format!("sleep 30; echo {marker}")])
            .spawn()
            .expect("spawn sleeper");
        let start = Instant::now();
        while !SystemProcesses.is_running(&marker) && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(SystemProcesses.is_running(&marker));
        assert!(SystemProcesses.kill_matching(&marker) >= 1);
        let _ = child.wait();
        assert!(!SystemProcesses.is_running(&marker));
    }

    #[cfg(unix)]
    #[test]
    fn terminate_child_stops_cooperative_process() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn");
        let start = Instant::now();
        terminate_child(&mut child, Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(child.try_wait().expect("poll").is_some());
    }
}
