use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way the helpers are read when merged.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}{}", self.stdout, self.stderr)
    }

    pub fn tail(&self, max_chars: usize) -> String {
        let combined = self.combined();
        let count = combined.chars().count();
        combined.chars().skip(count.saturating_sub(max_chars)).collect()
    }
}

/// A short-lived external command with its own deadline and environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `Some(value)` sets the variable, `None` removes it from the inherited environment.
    pub env: Vec<(String, Option<String>)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), Some(value.to_string())));
        self
    }

    pub fn without_env(mut self, key: &str) -> Self {
        self.env.push((key.to_string(), None));
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec, trace_id: &str) -> Result<CommandOutput, AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec, trace_id: &str) -> Result<CommandOutput, AppError> {
        run_command(spec, trace_id)
    }
}

pub fn apply_env(command: &mut Command, env: &[(String, Option<String>)]) {
    for (key, value) in env {
        match value {
            Some(value) => {
                command.env(key, value);
            }
            None => {
                command.env_remove(key);
            }
        }
    }
}

pub fn run_command(spec: &CommandSpec, trace_id: &str) -> Result<CommandOutput, AppError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_env(&mut command, &spec.env);

    let mut child = command.spawn().map_err(|err| {
        AppError::spawn(format!("Failed to spawn {}: {err}", spec.program), trace_id)
    })?;

    // Both pipes are read on their own threads so a full pipe never stalls the child.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > spec.timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("{} timed out after {:?}", spec.program, spec.timeout),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn megabyte_of_stdout_finishes_before_deadline() {
        let spec = CommandSpec::new(
            "sh",
            &[
                "-c",
                "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done",
            ],
            Duration::from_secs(10),
        );
        let output = run_command(&spec, "trace-chatty").expect("chatty command");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn timeout_maps_to_timeout_error() {
        let spec = CommandSpec::new("sh", &["-c", "sleep 5"], Duration::from_millis(200));
        let err = run_command(&spec, "trace-timeout").expect_err("should time out");
        assert!(err.is_timeout());
        assert_eq!(err.trace_id, "trace-timeout");
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let spec = CommandSpec::new(
            "/this/path/should/not/exist/idevice_id",
            &["-l"],
            Duration::from_secs(1),
        );
        let err = run_command(&spec, "trace-spawn").expect_err("spawn should fail");
        assert_eq!(err.code, crate::app::error::ERR_SPAWN);
    }

    #[test]
    fn env_overrides_are_applied() {
        let spec = CommandSpec::new("sh", &["-c", "echo \"$ALTHEA_TEST_SOCKET\""], Duration::from_secs(5))
            .with_env("ALTHEA_TEST_SOCKET", "127.0.0.1:27015");
        let output = run_command(&spec, "trace-env").expect("run");
        assert_eq!(output.stdout.trim(), "127.0.0.1:27015");
        assert_eq!(spec.env_value("ALTHEA_TEST_SOCKET"), Some("127.0.0.1:27015"));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let spec = CommandSpec::new("sh", &["-c", "printf 'ok\\377\\n'"], Duration::from_secs(5));
        let output = run_command(&spec, "trace-lossy").expect("run");
        assert!(output.stdout.starts_with("ok"));
        assert!(output.stdout.contains('\u{FFFD}'));
    }
}
