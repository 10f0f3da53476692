use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::AppError;
use crate::app::log_sink::LogSink;
use crate::app::process::control::terminate_child;
use crate::app::process::runner::apply_env;

/// Requests termination of a running helper. Safe to call from any thread and
/// more than once.
pub trait ProcessKiller: Send + Sync {
    fn terminate(&self);
}

pub type ProcessHandle = Arc<dyn ProcessKiller>;

/// The driver's view of the installer helper: a line stream of combined
/// output, a line-oriented input, and a way to stop it.
pub trait InstallerProcess: Send {
    /// Next output line without its terminator; `None` once output is closed.
    fn read_line(&mut self) -> Option<String>;
    fn write_input(&mut self, text: &str) -> io::Result<()>;
    fn handle(&self) -> ProcessHandle;
    /// Exit code, or `None` if the process did not exit within `timeout` or was killed by a signal.
    fn wait_exit(&mut self, timeout: Duration) -> Option<i32>;
}

struct ChildKiller {
    child: Arc<Mutex<Option<Child>>>,
    grace: Duration,
}

impl ProcessKiller for ChildKiller {
    fn terminate(&self) {
        let mut guard = self.child.lock().expect("child lock poisoned");
        if let Some(child) = guard.as_mut() {
            let code = terminate_child(child, self.grace);
            debug!(pid = child.id(), exit_code = ?code, "installer terminated");
        }
    }
}

pub struct SpawnedInstaller {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    grace: Duration,
}

impl SpawnedInstaller {
    /// Raw output bytes reach `log_sink` before line splitting, so a partial
    /// trailing line is still recorded if the process dies mid-write.
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &[(String, Option<String>)],
        log_sink: Option<Arc<LogSink>>,
        grace: Duration,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        // One pipe behind both stdout and stderr keeps the helper's write order.
        let (reader, writer) = io::pipe()
            .map_err(|err| AppError::system(format!("Failed to create output pipe: {err}"), trace_id))?;
        let writer_for_stderr = writer
            .try_clone()
            .map_err(|err| AppError::system(format!("Failed to create output pipe: {err}"), trace_id))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(writer_for_stderr);
        apply_env(&mut command, env);
        let spawned = command.spawn();
        // The parent's write ends live in `command`; drop them so EOF arrives when the child exits.
        drop(command);
        let mut child = spawned
            .map_err(|err| AppError::spawn(format!("Failed to start {program}: {err}"), trace_id))?;
        let stdin = child.stdin.take();

        let (sender, lines) = mpsc::channel();
        spawn_line_reader(reader, sender, log_sink);

        Ok(Self {
            child: Arc::new(Mutex::new(Some(child))),
            stdin,
            lines,
            grace,
        })
    }
}

fn spawn_line_reader<R>(mut reader: R, sender: Sender<String>, log_sink: Option<Arc<LogSink>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut pending = Vec::<u8>::new();
        let mut chunk = [0u8; 4096];
        loop {
            let count = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(count) => count,
            };
            if let Some(sink) = &log_sink {
                sink.append(&chunk[..count]);
            }
            pending.extend_from_slice(&chunk[..count]);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if sender.send(decode_line(&line)).is_err() {
                    return;
                }
            }
        }
        if !pending.is_empty() {
            let _ = sender.send(decode_line(&pending));
        }
    });
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

impl InstallerProcess for SpawnedInstaller {
    fn read_line(&mut self) -> Option<String> {
        self.lines.recv().ok()
    }

    fn write_input(&mut self, text: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(text.as_bytes())?;
        stdin.flush()
    }

    fn handle(&self) -> ProcessHandle {
        Arc::new(ChildKiller {
            child: Arc::clone(&self.child),
            grace: self.grace,
        })
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        self.stdin = None;
        let start = Instant::now();
        loop {
            {
                let mut guard = self.child.lock().expect("child lock poisoned");
                let child = guard.as_mut()?;
                match child.try_wait() {
                    Ok(Some(status)) => return status.code(),
                    Ok(None) => {}
                    Err(_) => return None,
                }
                if start.elapsed() >= timeout {
                    debug!(pid = child.id(), "installer did not exit in time; terminating");
                    terminate_child(child, self.grace);
                    return None;
                }
            }
            thread::sleep(Duration::from_millis(25));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str, sink: Option<Arc<LogSink>>) -> SpawnedInstaller {
        SpawnedInstaller::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &[],
            sink,
            Duration::from_secs(1),
            "trace",
        )
        .expect("spawn sh")
    }

    #[test]
    fn streams_combined_output_and_tees_to_sink() {
        let tmp = TempDir::new().expect("tmp");
        let sink = Arc::new(LogSink::new(tmp.path().join("althea.log")));
        let mut process = sh(
            "echo 'Progress: 10%'; echo 'warning' 1>&2; printf 'no newline'",
            Some(Arc::clone(&sink)),
        );
        let mut lines = Vec::new();
        while let Some(line) = process.read_line() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["Progress: 10%", "warning", "no newline"]);
        assert_eq!(process.wait_exit(Duration::from_secs(5)), Some(0));
        let logged = sink.read_since(0).expect("log").text;
        assert!(logged.contains("Progress: 10%"));
        assert!(logged.contains("no newline"));
    }

    #[test]
    fn interleaved_stdout_and_stderr_keep_write_order() {
        for _ in 0..50 {
            let mut process = sh("echo a 1>&2; echo b; echo c 1>&2; echo d", None);
            let mut lines = Vec::new();
            while let Some(line) = process.read_line() {
                lines.push(line);
            }
            assert_eq!(lines, vec!["a", "b", "c", "d"]);
            assert_eq!(process.wait_exit(Duration::from_secs(5)), Some(0));
        }
    }

    #[test]
    fn writes_answers_to_stdin() {
        let mut process = sh("read answer; echo \"got:$answer\"", None);
        process.write_input("123456\n").expect("write");
        assert_eq!(process.read_line().as_deref(), Some("got:123456"));
        assert_eq!(process.wait_exit(Duration::from_secs(5)), Some(0));
    }

    #[test]
    fn handle_terminates_running_process() {
        // exec so no orphaned grandchild keeps the output pipe open
        let mut process = sh("echo started; exec sleep 30", None);
        assert_eq!(process.read_line().as_deref(), Some("started"));
        process.handle().terminate();
        assert_eq!(process.read_line(), None);
        assert_eq!(process.wait_exit(Duration::from_secs(5)), None);
    }

    #[test]
    fn reports_nonzero_exit() {
        let mut process = sh("exit 3", None);
        assert_eq!(process.read_line(), None);
        assert_eq!(process.wait_exit(Duration::from_secs(5)), Some(3));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut process = sh("printf 'bad \\377 byte\\n'", None);
        let line = process.read_line().expect("line");
        assert!(line.starts_with("bad "));
        assert!(line.contains('\u{FFFD}'));
    }
}
